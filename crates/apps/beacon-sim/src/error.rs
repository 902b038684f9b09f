use beacon_link::{ConfigError, DecodeError, FragmentError, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("request encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("reply decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("fragment error: {0}")]
    Fragment(#[from] FragmentError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("simulated radio stopped")]
    RadioClosed,

    #[error("image is empty")]
    EmptyImage,

    #[error("{function} failed: {message}")]
    Remote { function: String, message: String, code: Option<i64> },

    #[error("unexpected reply to {function}: missing '{field}'")]
    MalformedReply { function: String, field: &'static str },
}
