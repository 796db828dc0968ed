//! Test doubles for the engine, buffer owner and surface.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::engine::{AccessUnit, DecodeEngine, DecodedOutput, EngineFactory, OpenRequest, Retrieved};
use crate::format::NegotiatedFormat;
use crate::frame::{BufferId, BufferRelease};
use crate::surface::{DrawTarget, Geometry, PresentTarget, Surface, Transform};

#[derive(Default)]
pub(crate) struct CountingOwner {
    released: Mutex<Vec<BufferId>>,
}

impl CountingOwner {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn released(&self) -> Vec<BufferId> {
        self.released.lock().unwrap().clone()
    }
}

impl BufferRelease for CountingOwner {
    fn release(&self, id: BufferId) {
        self.released.lock().unwrap().push(id);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub(crate) fn video_format(width: i32, height: i32) -> NegotiatedFormat {
    NegotiatedFormat::Video {
        width,
        height,
        color_format: Some(19),
        component: Some("scripted.video".to_string()),
        crop: None,
        rotation: None,
    }
}

/// Knobs and observations shared by every engine a [`ScriptedFactory`] creates.
pub(crate) struct ScriptedShared {
    pub(crate) owner: Arc<CountingOwner>,
    pub(crate) zero_copy: bool,
    pub(crate) fail_submit: AtomicBool,
    pub(crate) submitted: Mutex<Vec<i64>>,
    /// Results emitted right before the decoded output of the unit with this timestamp.
    pub(crate) before: Mutex<HashMap<i64, Vec<Retrieved>>>,
    pub(crate) format: Mutex<Option<NegotiatedFormat>>,
    pub(crate) flushes: AtomicUsize,
    pub(crate) shutdowns: AtomicUsize,
    next_id: AtomicU64,
}

impl ScriptedShared {
    pub(crate) fn new(zero_copy: bool) -> Arc<Self> {
        Arc::new(Self {
            owner: CountingOwner::new(),
            zero_copy,
            fail_submit: AtomicBool::new(false),
            submitted: Mutex::new(Vec::new()),
            before: Mutex::new(HashMap::new()),
            format: Mutex::new(Some(video_format(640, 480))),
            flushes: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
        })
    }

    pub(crate) fn inject_before(&self, timestamp: i64, results: Vec<Retrieved>) {
        self.before.lock().unwrap().insert(timestamp, results);
    }

    pub(crate) fn set_format(&self, format: NegotiatedFormat) {
        *self.format.lock().unwrap() = Some(format);
    }

    pub(crate) fn submitted(&self) -> Vec<i64> {
        self.submitted.lock().unwrap().clone()
    }
}

/// Decodes every unit into exactly one output with the same timestamp.
pub(crate) struct ScriptedEngine {
    shared: Arc<ScriptedShared>,
    pending: VecDeque<Retrieved>,
}

impl DecodeEngine for ScriptedEngine {
    fn submit(&mut self, unit: AccessUnit) -> anyhow::Result<()> {
        match unit {
            AccessUnit::Data {
                payload,
                timestamp,
                flags,
            } => {
                if self.shared.fail_submit.load(Ordering::SeqCst) {
                    anyhow::bail!("scripted submit failure");
                }
                self.shared.submitted.lock().unwrap().push(timestamp);
                if let Some(results) = self.shared.before.lock().unwrap().remove(&timestamp) {
                    self.pending.extend(results);
                }
                let output = if self.shared.zero_copy {
                    let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
                    DecodedOutput::External(BufferId(id))
                } else {
                    DecodedOutput::Bytes(payload)
                };
                self.pending.push_back(Retrieved::Decoded {
                    output,
                    timestamp,
                    flags,
                });
            }
            AccessUnit::EndOfStream => self.pending.push_back(Retrieved::EndOfStream),
        }
        Ok(())
    }

    fn retrieve(&mut self) -> Retrieved {
        self.pending.pop_front().unwrap_or(Retrieved::TryAgain)
    }

    fn negotiated_format(&self) -> Option<NegotiatedFormat> {
        self.shared.format.lock().unwrap().clone()
    }

    fn buffer_owner(&self) -> Arc<dyn BufferRelease> {
        self.shared.owner.clone()
    }

    fn renders_to_surface(&self) -> bool {
        self.shared.zero_copy
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.pending.clear();
        self.shared.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.shared.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) struct ScriptedFactory {
    pub(crate) shared: Arc<ScriptedShared>,
    pub(crate) fail_open: bool,
    pub(crate) requests: Mutex<Vec<OpenRequest>>,
}

impl ScriptedFactory {
    pub(crate) fn new(shared: Arc<ScriptedShared>) -> Arc<Self> {
        Arc::new(Self {
            shared,
            fail_open: false,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn failing(shared: Arc<ScriptedShared>) -> Arc<Self> {
        Arc::new(Self {
            shared,
            fail_open: true,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn engine(&self) -> Box<dyn DecodeEngine> {
        Box::new(ScriptedEngine {
            shared: self.shared.clone(),
            pending: VecDeque::new(),
        })
    }

    pub(crate) fn requests(&self) -> Vec<OpenRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl EngineFactory for ScriptedFactory {
    fn create(&self, request: &OpenRequest) -> anyhow::Result<Box<dyn DecodeEngine>> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail_open {
            anyhow::bail!("no decoder for {}", request.mime);
        }
        Ok(self.engine())
    }
}

// ---------------------------------------------------------------------------
// Surface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SurfaceEvent {
    Connect,
    Disconnect,
    Geometry(u32, u32, Transform),
    Drawn(Vec<u8>, i64),
    Buffer(BufferId, i64),
}

#[derive(Clone, Default)]
pub(crate) struct SurfaceEvents(Arc<Mutex<Vec<SurfaceEvent>>>);

impl SurfaceEvents {
    fn push(&self, event: SurfaceEvent) {
        self.0.lock().unwrap().push(event);
    }

    pub(crate) fn snapshot(&self) -> Vec<SurfaceEvent> {
        self.0.lock().unwrap().clone()
    }
}

pub(crate) struct RecordingSurface {
    events: SurfaceEvents,
}

impl RecordingSurface {
    pub(crate) fn new() -> (Self, SurfaceEvents) {
        let events = SurfaceEvents::default();
        (
            Self {
                events: events.clone(),
            },
            events,
        )
    }
}

impl Surface for RecordingSurface {
    fn connect(&mut self) -> anyhow::Result<()> {
        self.events.push(SurfaceEvent::Connect);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.events.push(SurfaceEvent::Disconnect);
    }

    fn set_usage_and_geometry(&mut self, geometry: &Geometry) -> anyhow::Result<()> {
        self.events.push(SurfaceEvent::Geometry(
            geometry.width,
            geometry.height,
            geometry.transform,
        ));
        Ok(())
    }

    fn acquire_draw_target(&mut self, len: usize) -> anyhow::Result<DrawTarget> {
        Ok(DrawTarget { data: vec![0; len] })
    }

    fn present(&mut self, target: PresentTarget, timestamp_us: i64) -> anyhow::Result<()> {
        let event = match target {
            PresentTarget::Drawn(target) => SurfaceEvent::Drawn(target.data, timestamp_us),
            PresentTarget::Buffer(id) => SurfaceEvent::Buffer(id, timestamp_us),
        };
        self.events.push(event);
        Ok(())
    }
}
