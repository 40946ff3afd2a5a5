//! Content sniffing for downloaded artifacts.
//!
//! The declared `Content-Type` is the least trusted signal: magic bytes
//! first, then HTML/JSON/plain-text heuristics on the first 1 KiB, then the
//! declared type, then the filename extension.

use url::Url;

const SNIPPET_LIMIT: usize = 1024;

/// Transport method chosen for one artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMethod {
    SendPhoto,
    SendVideo,
    SendAudio,
    SendVoice,
    SendAnimation,
    SendDocument,
}

pub fn normalize_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase()
}

/// Magic-byte detection for the formats the pipeline ships.
pub fn detect_magic_type(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(b"\x89PNG") {
        return Some("image/png");
    }
    if data.starts_with(b"\xff\xd8\xff") {
        return Some("image/jpeg");
    }
    if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WAVE" {
        return Some("audio/wav");
    }
    if data.starts_with(b"OggS") {
        return Some("audio/ogg");
    }
    if data.starts_with(b"ID3") || data.starts_with(b"\xff\xfb") {
        return Some("audio/mpeg");
    }
    if data.starts_with(b"%PDF") {
        return Some("application/pdf");
    }
    if data.starts_with(b"PK\x03\x04") {
        return Some("application/zip");
    }
    let head = &data[..data.len().min(16)];
    if head.windows(6).any(|window| window == b"ftypqt") {
        return Some("video/quicktime");
    }
    if head.windows(4).any(|window| window == b"ftyp") {
        return Some("video/mp4");
    }
    None
}

pub fn looks_like_html(data: &[u8], content_type: &str) -> bool {
    if normalize_content_type(content_type) == "text/html" {
        return true;
    }
    let snippet: Vec<u8> = data
        .iter()
        .take(SNIPPET_LIMIT)
        .copied()
        .collect::<Vec<u8>>()
        .to_ascii_lowercase();
    let trimmed: &[u8] = {
        let start = snippet
            .iter()
            .position(|byte| !byte.is_ascii_whitespace())
            .unwrap_or(snippet.len());
        &snippet[start..]
    };
    trimmed.starts_with(b"<!doctype html")
        || trimmed.starts_with(b"<html")
        || snippet.windows(5).any(|window| window == b"<html")
}

fn looks_like_json(data: &[u8]) -> bool {
    let first = data
        .iter()
        .take(SNIPPET_LIMIT)
        .find(|byte| !byte.is_ascii_whitespace());
    matches!(first, Some(b'{') | Some(b'['))
}

fn looks_like_text(data: &[u8]) -> bool {
    if data.is_empty() {
        return false;
    }
    let snippet = &data[..data.len().min(SNIPPET_LIMIT)];
    let decoded = String::from_utf8_lossy(snippet);
    if decoded.is_empty() {
        return false;
    }
    let printable = decoded
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\r' | '\n' | '\t'))
        .count();
    printable >= (decoded.chars().count() * 9).div_ceil(10)
}

fn guess_from_extension(url: &str) -> Option<&'static str> {
    let path = Url::parse(url).ok()?.path().to_lowercase();
    let table: &[(&str, &str)] = &[
        (".png", "image/png"),
        (".jpg", "image/jpeg"),
        (".jpeg", "image/jpeg"),
        (".webp", "image/webp"),
        (".gif", "image/gif"),
        (".mp4", "video/mp4"),
        (".mov", "video/quicktime"),
        (".webm", "video/webm"),
        (".mp3", "audio/mpeg"),
        (".wav", "audio/wav"),
        (".ogg", "audio/ogg"),
        (".pdf", "application/pdf"),
        (".zip", "application/zip"),
        (".txt", "text/plain"),
        (".json", "application/json"),
    ];
    table
        .iter()
        .find(|(ext, _)| path.ends_with(ext))
        .map(|(_, mime)| *mime)
}

/// Resolve the effective content type of a payload.
pub fn resolve_real_mime(declared: &str, data: &[u8], url: &str) -> String {
    let normalized = normalize_content_type(declared);
    if matches!(normalized.as_str(), "text/html" | "text/plain" | "application/json") {
        return normalized;
    }
    if let Some(magic) = detect_magic_type(data) {
        return magic.to_string();
    }
    if looks_like_html(data, &normalized) {
        return "text/html".to_string();
    }
    if looks_like_json(data) {
        return "application/json".to_string();
    }
    if looks_like_text(data) {
        return "text/plain".to_string();
    }
    if normalized.starts_with("image/")
        || normalized.starts_with("video/")
        || normalized.starts_with("audio/")
    {
        // Declared media with no recognizable signature: distrust it.
        return "application/octet-stream".to_string();
    }
    if !normalized.is_empty() {
        return normalized;
    }
    guess_from_extension(url)
        .unwrap_or("application/octet-stream")
        .to_string()
}

pub fn is_textual_type(content_type: &str) -> bool {
    let normalized = normalize_content_type(content_type);
    normalized.starts_with("text/")
        || matches!(normalized.as_str(), "application/json" | "application/xml")
}

/// Pick the transport method for a resolved content type.
pub fn method_for_type(content_type: &str) -> TransportMethod {
    let normalized = normalize_content_type(content_type);
    if normalized == "image/gif" {
        return TransportMethod::SendAnimation;
    }
    if normalized.starts_with("image/") {
        return TransportMethod::SendPhoto;
    }
    if normalized.starts_with("video/") {
        return TransportMethod::SendVideo;
    }
    if normalized == "audio/ogg" || normalized == "audio/opus" {
        return TransportMethod::SendVoice;
    }
    if normalized.starts_with("audio/") {
        return TransportMethod::SendAudio;
    }
    TransportMethod::SendDocument
}

pub fn extension_for_type(content_type: &str) -> &'static str {
    match normalize_content_type(content_type).as_str() {
        "image/png" => ".png",
        "image/jpeg" => ".jpg",
        "image/webp" => ".webp",
        "image/gif" => ".gif",
        "video/mp4" => ".mp4",
        "video/quicktime" => ".mov",
        "video/webm" => ".webm",
        "audio/mpeg" => ".mp3",
        "audio/wav" => ".wav",
        "audio/ogg" => ".ogg",
        "application/pdf" => ".pdf",
        "application/zip" => ".zip",
        "text/plain" => ".txt",
        "application/json" => ".json",
        _ => ".bin",
    }
}

/// Filename for an upload: URL basename with a type-derived extension, or a
/// configured prefix override.
pub fn derive_filename(
    url: &str,
    content_type: &str,
    index: usize,
    filename_prefix: Option<&str>,
) -> String {
    let extension = extension_for_type(content_type);
    if let Some(prefix) = filename_prefix {
        return format!("{prefix}_{index}{extension}");
    }
    let basename = Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .unwrap_or_default();
    if basename.is_empty() {
        return format!("result_{index}{extension}");
    }
    if basename.contains('.') {
        basename
    } else {
        format!("{basename}{extension}")
    }
}
