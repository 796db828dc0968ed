/// Registers FFmpeg components. Call once at startup before opening sources or decoders.
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

pub mod config;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod format;
pub mod frame;
pub mod hw;
pub mod input_stage;
pub mod mime;
pub mod pipeline;
pub mod slot_pool;
pub mod source;
pub mod surface;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use config::PipelineConfig;
pub use error::PipelineError;
pub use pipeline::{OutputEvent, OutputFrame, PipelineFacade};
