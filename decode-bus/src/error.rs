use thiserror::Error;

use crate::format::FormatError;

/// Failures surfaced to callers of the pipeline facade.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline is not configured")]
    NotConfigured,

    #[error("pipeline is already open")]
    AlreadyOpen,

    #[error("invalid dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    #[error("failed to open decoder for {mime}: {source}")]
    Open {
        mime: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("format negotiation failed: {0}")]
    Format(#[from] FormatError),

    #[error("surface unavailable: {0:#}")]
    Surface(#[source] anyhow::Error),

    #[error("decode engine failed: {0}")]
    Engine(String),

    #[error("pipeline has been torn down")]
    TornDown,
}

pub type Result<T> = std::result::Result<T, PipelineError>;
