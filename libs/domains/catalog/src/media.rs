use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Deliverable artifact kind.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Text,
    #[default]
    Document,
}

impl MediaKind {
    /// Interpret a provider media hint (`mediaType`/`outputType`/`type`).
    pub fn from_hint(raw: &str) -> Option<Self> {
        let normalized = raw.to_lowercase();
        match normalized.as_str() {
            "image" | "img" | "photo" | "picture" => return Some(Self::Image),
            "video" | "mp4" | "mov" => return Some(Self::Video),
            "audio" | "voice" | "speech" => return Some(Self::Audio),
            "text" | "json" | "markdown" => return Some(Self::Text),
            "document" | "file" | "binary" => return Some(Self::Document),
            _ => {}
        }
        if normalized.contains("image") {
            Some(Self::Image)
        } else if normalized.contains("video") {
            Some(Self::Video)
        } else if normalized.contains("audio") || normalized.contains("speech") {
            Some(Self::Audio)
        } else if normalized.contains("text") {
            Some(Self::Text)
        } else {
            None
        }
    }

    /// Infer a kind from a URL's extension.
    pub fn from_url_extension(url: &str) -> Option<Self> {
        let lower = url.to_lowercase();
        let lower = lower.split(['?', '#']).next().unwrap_or(&lower);
        if [".png", ".jpg", ".jpeg", ".webp", ".gif"]
            .iter()
            .any(|ext| lower.ends_with(ext))
        {
            Some(Self::Image)
        } else if [".mp4", ".mov", ".webm", ".mkv"]
            .iter()
            .any(|ext| lower.ends_with(ext))
        {
            Some(Self::Video)
        } else if [".mp3", ".wav", ".ogg", ".m4a", ".aac", ".flac"]
            .iter()
            .any(|ext| lower.ends_with(ext))
        {
            Some(Self::Audio)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_exact_values() {
        assert_eq!(MediaKind::from_hint("photo"), Some(MediaKind::Image));
        assert_eq!(MediaKind::from_hint("MP4"), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_hint("speech"), Some(MediaKind::Audio));
        assert_eq!(MediaKind::from_hint("markdown"), Some(MediaKind::Text));
        assert_eq!(MediaKind::from_hint("binary"), Some(MediaKind::Document));
    }

    #[test]
    fn test_hint_substring_fallback() {
        assert_eq!(MediaKind::from_hint("image_hd"), Some(MediaKind::Image));
        assert_eq!(MediaKind::from_hint("speech_v2"), Some(MediaKind::Audio));
        assert_eq!(MediaKind::from_hint("mystery"), None);
    }

    #[test]
    fn test_url_extension_inference() {
        assert_eq!(
            MediaKind::from_url_extension("https://cdn/img.PNG"),
            Some(MediaKind::Image)
        );
        assert_eq!(
            MediaKind::from_url_extension("https://cdn/vid.webm?sig=abc"),
            Some(MediaKind::Video)
        );
        assert_eq!(
            MediaKind::from_url_extension("https://cdn/sound.flac"),
            Some(MediaKind::Audio)
        );
        assert_eq!(MediaKind::from_url_extension("https://cdn/file.pdf"), None);
    }

    #[test]
    fn test_display_and_parse_round_trip() {
        assert_eq!(MediaKind::Image.to_string(), "image");
        assert_eq!("video".parse::<MediaKind>().unwrap(), MediaKind::Video);
    }
}
