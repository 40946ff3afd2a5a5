use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Download failed: {0}")]
    Download(String),

    #[error("Chat transport refused the send: {0}")]
    Transport(String),

    #[error("Payload of {size} bytes exceeds the {limit} byte upload limit")]
    TooLarge { size: u64, limit: u64 },

    #[error("Result URL served an HTML page: {0}")]
    HtmlPayload(String),

    #[error("Invalid result URL: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Storage(#[from] storage::StorageError),
}

impl DeliveryError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Download(_) => "TG_DELIVER_FAILED",
            Self::Transport(_) => "TG_DELIVER_FAILED",
            Self::TooLarge { .. } => "TG_MEDIA_TOO_LARGE",
            Self::HtmlPayload(_) => "KIE_RESULT_INVALID_CONTENT",
            Self::InvalidUrl(_) => "INVALID_RESULT_URL",
            Self::Storage(e) => e.code(),
        }
    }
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;
