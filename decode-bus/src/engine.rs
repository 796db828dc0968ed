use std::sync::Arc;

use bytes::Bytes;

use crate::format::NegotiatedFormat;
use crate::frame::{BufferId, BufferRelease, FrameFlags};
use crate::mime::MediaKind;

/// One encoded unit handed to the engine.
#[derive(Debug, Clone)]
pub enum AccessUnit {
    Data {
        payload: Bytes,
        timestamp: i64,
        flags: FrameFlags,
    },
    EndOfStream,
}

#[derive(Debug, Clone)]
pub enum DecodedOutput {
    /// Decoded bytes copied out of the engine.
    Bytes(Bytes),
    /// Buffer retained by the engine until released through its [`BufferRelease`].
    External(BufferId),
}

#[derive(Debug, Clone)]
pub enum Retrieved {
    TryAgain,
    Decoded {
        output: DecodedOutput,
        timestamp: i64,
        flags: FrameFlags,
    },
    FormatChanged,
    EndOfStream,
    Discontinuity,
    Error(i32),
}

/// A decoder the pipeline drives from its worker thread.
pub trait DecodeEngine: Send {
    fn submit(&mut self, unit: AccessUnit) -> anyhow::Result<()>;

    fn retrieve(&mut self) -> Retrieved;

    fn negotiated_format(&self) -> Option<NegotiatedFormat>;

    fn buffer_owner(&self) -> Arc<dyn BufferRelease>;

    /// True when decoded buffers stay inside the engine and go straight to the surface.
    fn renders_to_surface(&self) -> bool;

    fn flush(&mut self) -> anyhow::Result<()>;

    fn shutdown(&mut self);
}

#[derive(Debug, Clone)]
pub struct OpenRequest {
    pub mime: String,
    pub kind: MediaKind,
    pub width: u32,
    pub height: u32,
    pub codec_config: Option<Bytes>,
    pub surface_attached: bool,
    pub prefer_hardware: bool,
}

pub trait EngineFactory: Send + Sync {
    fn create(&self, request: &OpenRequest) -> anyhow::Result<Box<dyn DecodeEngine>>;
}
