use std::fmt::{Display, Formatter};
use std::sync::Arc;

use bytes::Bytes;

/// Stream-level status carried by every frame. Sentinel frames carry only this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameStatus {
    #[default]
    Ok,
    EndOfStream,
    FormatChanged,
    Discontinuity,
    Error(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct FrameFlags(u32);

impl FrameFlags {
    pub const NONE: FrameFlags = FrameFlags(0);
    pub const CODEC_CONFIG: FrameFlags = FrameFlags(1 << 0);
    pub const SYNC_POINT: FrameFlags = FrameFlags(1 << 1);
    pub const END_OF_ACCESS_UNIT: FrameFlags = FrameFlags(1 << 2);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for FrameFlags {
    type Output = FrameFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        FrameFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for FrameFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Identifier of a buffer owned by the decode engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl Display for BufferId {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "#{}", self.0)
    }
}

/// The side that hands out external buffers and takes them back.
pub trait BufferRelease: Send + Sync {
    fn release(&self, id: BufferId);
}

/// Handle to a buffer that lives inside the decode engine.
///
/// The handle is move-only. It goes back to its owner exactly once: either through
/// [`ExternalBuffer::release`] or, as a last resort, when it is dropped.
pub struct ExternalBuffer {
    id: BufferId,
    owner: Arc<dyn BufferRelease>,
    released: bool,
}

impl ExternalBuffer {
    pub fn new(id: BufferId, owner: Arc<dyn BufferRelease>) -> Self {
        Self {
            id,
            owner,
            released: false,
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn release(mut self) {
        self.released = true;
        self.owner.release(self.id);
    }
}

impl Drop for ExternalBuffer {
    fn drop(&mut self) {
        if !self.released {
            log::warn!("external buffer {} dropped without release", self.id);
            self.owner.release(self.id);
        }
    }
}

impl std::fmt::Debug for ExternalBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalBuffer").field("id", &self.id).finish()
    }
}

#[derive(Debug, Default)]
pub enum Payload {
    #[default]
    Empty,
    Owned(Bytes),
    External(ExternalBuffer),
}

/// Cheap look at a payload that stays owned by somebody else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadView {
    Empty,
    Bytes(Bytes),
    Buffer(BufferId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameView {
    pub status: FrameStatus,
    pub timestamp: i64,
    pub flags: FrameFlags,
    pub payload: PayloadView,
}

#[derive(Debug, Default)]
pub struct Frame {
    status: FrameStatus,
    timestamp: i64,
    flags: FrameFlags,
    payload: Payload,
}

impl Frame {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Status-only frame used to signal end-of-stream, format changes and discontinuities
    /// in band with real payloads.
    pub fn sentinel(status: FrameStatus) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    /// Deep-copies `data`. An empty slice produces a payload-less frame.
    pub fn from_bytes(status: FrameStatus, data: &[u8], timestamp: i64, flags: FrameFlags) -> Self {
        let payload = if data.is_empty() {
            Payload::Empty
        } else {
            Payload::Owned(Bytes::copy_from_slice(data))
        };
        Self {
            status,
            timestamp,
            flags,
            payload,
        }
    }

    /// Takes `data` as is, without copying.
    pub fn from_owned(status: FrameStatus, data: Bytes, timestamp: i64, flags: FrameFlags) -> Self {
        let payload = if data.is_empty() {
            Payload::Empty
        } else {
            Payload::Owned(data)
        };
        Self {
            status,
            timestamp,
            flags,
            payload,
        }
    }

    pub fn from_external(
        status: FrameStatus,
        buffer: ExternalBuffer,
        timestamp: i64,
        flags: FrameFlags,
    ) -> Self {
        Self {
            status,
            timestamp,
            flags,
            payload: Payload::External(buffer),
        }
    }

    pub fn swap(&mut self, other: &mut Frame) {
        std::mem::swap(self, other);
    }

    /// Drops the payload. Owned bytes are freed at once; an external buffer is queued on
    /// `deferred` when given, otherwise handed back to the engine immediately.
    pub fn release(&mut self, deferred: Option<&mut Vec<ExternalBuffer>>) {
        match std::mem::take(&mut self.payload) {
            Payload::Empty | Payload::Owned(_) => {}
            Payload::External(buffer) => match deferred {
                Some(list) => list.push(buffer),
                None => buffer.release(),
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.payload, Payload::Empty)
    }

    pub fn is_external(&self) -> bool {
        matches!(self.payload, Payload::External(_))
    }

    /// Deep copy. Frames holding an external buffer cannot be copied.
    pub fn try_clone(&self) -> Option<Frame> {
        let payload = match &self.payload {
            Payload::Empty => Payload::Empty,
            Payload::Owned(data) => Payload::Owned(Bytes::copy_from_slice(data)),
            Payload::External(_) => return None,
        };
        Some(Frame {
            status: self.status,
            timestamp: self.timestamp,
            flags: self.flags,
            payload,
        })
    }

    pub fn view(&self) -> FrameView {
        let payload = match &self.payload {
            Payload::Empty => PayloadView::Empty,
            Payload::Owned(data) => PayloadView::Bytes(data.clone()),
            Payload::External(buffer) => PayloadView::Buffer(buffer.id()),
        };
        FrameView {
            status: self.status,
            timestamp: self.timestamp,
            flags: self.flags,
            payload,
        }
    }

    pub fn status(&self) -> FrameStatus {
        self.status
    }

    pub fn set_status(&mut self, status: FrameStatus) {
        self.status = status;
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn flags(&self) -> FrameFlags {
        self.flags
    }

    pub fn data(&self) -> Option<&Bytes> {
        match &self.payload {
            Payload::Owned(data) => Some(data),
            _ => None,
        }
    }

    pub fn buffer_id(&self) -> Option<BufferId> {
        match &self.payload {
            Payload::External(buffer) => Some(buffer.id()),
            _ => None,
        }
    }

    pub fn size(&self) -> usize {
        self.data().map(|d| d.len()).unwrap_or_default()
    }

    pub fn take_payload(&mut self) -> Payload {
        std::mem::take(&mut self.payload)
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match &self.payload {
            Payload::Empty => write!(
                f,
                "Frame {{ status: {:?}, ts: {} }}",
                self.status, self.timestamp
            ),
            Payload::Owned(data) => write!(
                f,
                "Frame {{ status: {:?}, ts: {}, data: {} }}",
                self.status,
                self.timestamp,
                data.len()
            ),
            Payload::External(buffer) => write!(
                f,
                "Frame {{ status: {:?}, ts: {}, buffer: {} }}",
                self.status,
                self.timestamp,
                buffer.id()
            ),
        }
    }
}
