use thiserror::Error;

/// Application error type.
///
/// Only genuinely fatal conditions surface here: cache-file IO, client
/// construction/transport failures and API-level refusals. Per-image parse
/// problems are not errors — images without usable metadata are skipped.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Hydrus API error: {0}")]
    Api(String),

    #[error("{0}")]
    Config(String),
}
