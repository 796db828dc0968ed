//! Synchronous facade over the input stage, the decode worker and the output pool.
//!
//! One producer thread calls [`PipelineFacade::feed`], one consumer thread calls
//! [`PipelineFacade::take_ready`] and [`PipelineFacade::release`], and any thread may
//! configure, flush or tear down.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::engine::{DecodeEngine, EngineFactory, OpenRequest};
use crate::error::{PipelineError, Result};
use crate::format::{self, OutputFormat};
use crate::frame::{Frame, FrameFlags, FrameStatus, Payload, PayloadView};
use crate::input_stage::InputStage;
use crate::mime::MediaKind;
use crate::slot_pool::{SlotPool, time_left};
use crate::surface::{Renderer, Surface, SurfaceToken};
use crate::worker::{DecodeWorker, WorkerShared, WorkerState};

/// Stream description shared with the worker, which updates the format on changes.
#[derive(Debug, Default)]
pub struct StreamState {
    pub format: Option<OutputFormat>,
    pub component: String,
    pub kind: Option<MediaKind>,
    pub mime: Option<String>,
    pub width: u32,
    pub height: u32,
    pub codec_config: Option<Bytes>,
    pub configured: bool,
    pub delayed_open: bool,
    pub torn_down: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFrame {
    pub index: usize,
    pub payload: PayloadView,
    pub timestamp: i64,
    pub flags: FrameFlags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Frame(OutputFrame),
    WouldBlock,
    EndOfStream,
    FormatChanged,
}

#[derive(Default)]
struct Control {
    worker: Option<JoinHandle<Box<dyn DecodeEngine>>>,
    renders_to_surface: bool,
    needs_rearm: bool,
}

pub struct PipelineFacade {
    config: PipelineConfig,
    factory: Arc<dyn EngineFactory>,
    input: Arc<InputStage>,
    output: Arc<SlotPool>,
    stream: Arc<Mutex<StreamState>>,
    shared: Arc<WorkerShared>,
    control: Mutex<Control>,
    renderer: Mutex<Option<Renderer>>,
    cancel: CancellationToken,
}

impl PipelineFacade {
    pub fn new(config: PipelineConfig, factory: Arc<dyn EngineFactory>) -> Self {
        let config = config.sanitized();
        let input = Arc::new(InputStage::new(config.early_buffer_limit));
        let output = Arc::new(SlotPool::new(
            config.output_capacity,
            config.max_in_flight,
            config.block_when_full,
        ));
        let stream = Arc::new(Mutex::new(StreamState::default()));
        let shared = Arc::new(WorkerShared::new(
            input.clone(),
            output.clone(),
            stream.clone(),
            config.clone(),
        ));
        Self {
            config,
            factory,
            input,
            output,
            stream,
            shared,
            control: Mutex::new(Control::default()),
            renderer: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    fn stream(&self) -> MutexGuard<'_, StreamState> {
        self.stream.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn renderer(&self) -> MutexGuard<'_, Option<Renderer>> {
        self.renderer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the stream parameters and connects the surface, if any.
    pub fn configure(
        &self,
        surface: Option<Box<dyn Surface>>,
        width: u32,
        height: u32,
        codec_config: Option<&[u8]>,
    ) -> Result<()> {
        if (width == 0) != (height == 0) {
            return Err(PipelineError::InvalidDimensions { width, height });
        }
        {
            let mut stream = self.stream();
            if stream.torn_down {
                return Err(PipelineError::TornDown);
            }
            stream.width = width;
            stream.height = height;
            stream.codec_config = codec_config
                .filter(|c| !c.is_empty())
                .map(Bytes::copy_from_slice);
            stream.configured = true;
        }

        if let Some(surface) = surface {
            let token = SurfaceToken::acquire(surface).map_err(PipelineError::Surface)?;
            *self.renderer() = Some(Renderer::new(token));
        }
        log::info!("pipeline configured {}x{}", width, height);
        Ok(())
    }

    /// Creates the engine for `mime` and starts the worker.
    ///
    /// Audio streams without codec configuration wait for the first codec-config unit.
    pub fn open(&self, mime: &str) -> Result<()> {
        let mut control = self.control();
        let request = {
            let mut stream = self.stream();
            if stream.torn_down {
                return Err(PipelineError::TornDown);
            }
            if !stream.configured {
                return Err(PipelineError::NotConfigured);
            }
            if control.worker.is_some() || stream.delayed_open {
                return Err(PipelineError::AlreadyOpen);
            }
            let kind = MediaKind::from_mime(mime).ok_or_else(|| PipelineError::Open {
                mime: mime.to_string(),
                source: anyhow::anyhow!("unsupported media type"),
            })?;
            if kind == MediaKind::Video && (stream.width == 0 || stream.height == 0) {
                return Err(PipelineError::InvalidDimensions {
                    width: stream.width,
                    height: stream.height,
                });
            }
            stream.kind = Some(kind);
            stream.mime = Some(mime.to_string());

            if kind == MediaKind::Audio && stream.codec_config.is_none() {
                log::info!("delaying open of {} until codec config arrives", mime);
                stream.delayed_open = true;
                return Ok(());
            }
            self.open_request(&stream)
        };
        self.start_engine(&mut control, request)
    }

    fn open_request(&self, stream: &StreamState) -> OpenRequest {
        OpenRequest {
            mime: stream.mime.clone().unwrap_or_default(),
            kind: stream.kind.unwrap_or(MediaKind::Video),
            width: stream.width,
            height: stream.height,
            codec_config: stream.codec_config.clone(),
            surface_attached: self.renderer().is_some(),
            prefer_hardware: self.config.prefer_hardware,
        }
    }

    fn start_engine(&self, control: &mut Control, request: OpenRequest) -> Result<()> {
        let mut engine = self
            .factory
            .create(&request)
            .map_err(|source| PipelineError::Open {
                mime: request.mime.clone(),
                source,
            })?;

        let initial = match engine.negotiated_format() {
            Some(negotiated) => match format::resolve(request.kind, &negotiated) {
                Ok(resolved) => Some(resolved),
                Err(err) => {
                    engine.shutdown();
                    return Err(err.into());
                }
            },
            None => None,
        };
        if let Some((format, component)) = initial {
            log::info!("{} opened with {}: {:?}", request.mime, component, format);
            {
                let mut stream = self.stream();
                stream.format = Some(format);
                stream.component = component;
            }
            if self
                .output
                .publish(Frame::sentinel(FrameStatus::FormatChanged), false)
                .is_err()
            {
                log::warn!("could not publish initial format");
            }
        }

        control.renders_to_surface = engine.renders_to_surface();
        let worker = DecodeWorker::new(
            self.shared.clone(),
            engine,
            self.cancel.child_token(),
            request.kind,
        );
        let handle = worker.spawn().map_err(|err| PipelineError::Open {
            mime: request.mime.clone(),
            source: err.into(),
        })?;
        control.worker = Some(handle);
        Ok(())
    }

    /// Restarts the worker after a flush once the previous one has stopped.
    fn maybe_rearm(&self, control: &mut Control) -> Result<()> {
        if !control.needs_rearm || self.shared.state() != WorkerState::Stopped {
            return Ok(());
        }
        let Some(handle) = control.worker.take() else {
            control.needs_rearm = false;
            return Ok(());
        };
        let mut engine = handle
            .join()
            .map_err(|_| PipelineError::Engine("decode worker panicked".to_string()))?;
        if let Err(err) = engine.flush() {
            engine.shutdown();
            return Err(PipelineError::Engine(format!("{:#}", err)));
        }
        self.shared.rearm();
        self.input.reset();
        control.needs_rearm = false;

        let kind = self.stream().kind.unwrap_or(MediaKind::Video);
        let worker = DecodeWorker::new(
            self.shared.clone(),
            engine,
            self.cancel.child_token(),
            kind,
        );
        let handle = worker
            .spawn()
            .map_err(|err| PipelineError::Engine(err.to_string()))?;
        control.worker = Some(handle);
        log::info!("decode worker re-armed after flush");
        Ok(())
    }

    /// Queues one access unit. `Ok(false)` means the unit was not accepted and should be
    /// offered again later.
    pub fn feed(&self, payload: &[u8], timestamp: i64, flags: FrameFlags) -> Result<bool> {
        if let Some(message) = self.shared.fatal_error() {
            return Err(PipelineError::Engine(message));
        }
        {
            let mut control = self.control();
            let delayed = {
                let mut stream = self.stream();
                if stream.torn_down {
                    return Err(PipelineError::TornDown);
                }
                if stream.mime.is_none() {
                    return Err(PipelineError::NotConfigured);
                }
                if stream.delayed_open
                    && flags.contains(FrameFlags::CODEC_CONFIG)
                    && !payload.is_empty()
                {
                    stream.codec_config = Some(Bytes::copy_from_slice(payload));
                    stream.delayed_open = false;
                    Some(self.open_request(&stream))
                } else {
                    None
                }
            };
            if let Some(request) = delayed {
                self.start_engine(&mut control, request)?;
                return Ok(true);
            }
            self.maybe_rearm(&mut control)?;
        }

        let frame = Frame::from_bytes(FrameStatus::Ok, payload, timestamp, flags);
        if !self.input.is_attached() {
            return Ok(self.input.push(frame));
        }
        let (capacity, budget) = (self.config.input_capacity, self.config.ingress_budget());
        match self.input.push_bounded(frame, capacity, budget) {
            Ok(_) => {
                self.shared.input_pressure.store(false, Ordering::SeqCst);
                Ok(true)
            }
            Err(_) => {
                log::debug!("input full, rejecting unit at {}", timestamp);
                self.shared.input_pressure.store(true, Ordering::SeqCst);
                Ok(false)
            }
        }
    }

    pub fn can_accept_more(&self) -> bool {
        if self.shared.fatal_error().is_some() || self.stream().torn_down {
            return false;
        }
        let limit = if self.input.is_attached() {
            self.config.input_capacity
        } else {
            self.config.early_buffer_limit
        };
        self.input.len() < limit
    }

    /// Waits up to `timeout` for the next output event. Status-only slots are consumed here.
    pub fn take_ready(&self, timeout: Duration) -> Result<OutputEvent> {
        if self.stream().torn_down {
            return Err(PipelineError::TornDown);
        }
        if !self.input.is_attached() {
            return Ok(OutputEvent::WouldBlock);
        }

        let deadline = Instant::now().checked_add(timeout);
        loop {
            if let Some((index, view)) = self.output.hold_next() {
                match view.status {
                    FrameStatus::Ok => {
                        return Ok(OutputEvent::Frame(OutputFrame {
                            index,
                            payload: view.payload,
                            timestamp: view.timestamp,
                            flags: view.flags,
                        }));
                    }
                    FrameStatus::EndOfStream => {
                        self.output.pull(index);
                        return Ok(OutputEvent::EndOfStream);
                    }
                    FrameStatus::FormatChanged => {
                        self.output.pull(index);
                        self.on_format_changed();
                        return Ok(OutputEvent::FormatChanged);
                    }
                    other => {
                        log::debug!("dropping output sentinel {:?}", other);
                        self.output.pull(index);
                        continue;
                    }
                }
            }

            // input queued behind a finished flush needs a fresh worker
            if self.input.len() > 0 {
                self.maybe_rearm(&mut self.control())?;
            }
            let left = time_left(deadline);
            if left.is_none() || self.output.is_closed() {
                return Ok(OutputEvent::WouldBlock);
            }
            let slice = self.config.poll_slice();
            self.output.wait_ready(left.map_or(slice, |left| left.min(slice)));
        }
    }

    fn on_format_changed(&self) {
        let renders_to_surface = self.control().renders_to_surface;
        if renders_to_surface {
            return;
        }
        let format = match self.stream().format.clone() {
            Some(OutputFormat::Video(format)) => format,
            _ => return,
        };
        if let Some(renderer) = self.renderer().as_mut() {
            if let Err(err) = renderer.init(&format) {
                log::warn!("failed to configure renderer: {:#}", err);
            }
        }
    }

    /// Returns a held output slot. A non-negative `timestamp` presents the frame on the
    /// surface first; a negative one just frees it.
    pub fn release(&self, index: usize, timestamp: i64) -> bool {
        let mut renderer = self.renderer();
        let released = match renderer.as_mut() {
            Some(renderer) if timestamp >= 0 => match self.output.pull(index) {
                Some(mut frame) => {
                    Self::present(renderer, &mut frame, timestamp);
                    true
                }
                None => false,
            },
            _ => self.output.release(index),
        };
        drop(renderer);
        self.output.drain_deferred();
        released
    }

    fn present(renderer: &mut Renderer, frame: &mut Frame, timestamp: i64) {
        match frame.take_payload() {
            Payload::Empty => {}
            Payload::Owned(data) => {
                if let Err(err) = renderer.render_bytes(&data, timestamp) {
                    log::warn!("render failed at {}: {:#}", timestamp, err);
                }
            }
            Payload::External(buffer) => {
                if let Err(err) = renderer.present_buffer(buffer.id(), timestamp) {
                    log::warn!("present failed at {}: {:#}", timestamp, err);
                }
                buffer.release();
            }
        }
    }

    /// Drains the current worker to end-of-stream. The consumer sees `EndOfStream`;
    /// the next `feed` starts a fresh worker.
    pub fn flush(&self) -> Result<()> {
        let mut control = self.control();
        if self.stream().torn_down {
            return Err(PipelineError::TornDown);
        }
        if control.worker.is_none() {
            self.input.clear();
            return Ok(());
        }
        if control.needs_rearm {
            return Ok(());
        }
        log::info!("flushing pipeline");
        self.shared.flush_pending.store(true, Ordering::SeqCst);
        self.input.signal_end_of_stream();
        control.needs_rearm = true;
        Ok(())
    }

    /// Stops the worker and releases the engine. Safe to call more than once.
    pub fn teardown(&self) {
        let mut control = self.control();
        {
            let mut stream = self.stream();
            if stream.torn_down {
                return;
            }
            stream.torn_down = true;
        }
        log::info!("tearing down pipeline");

        self.input.interrupt();
        self.input.clear();
        self.input.signal_end_of_stream();
        self.output.close();
        self.cancel.cancel();

        if let Some(handle) = control.worker.take() {
            match handle.join() {
                Ok(mut engine) => {
                    self.output.clear_all();
                    engine.shutdown();
                }
                Err(_) => log::error!("decode worker panicked"),
            }
        }
        self.output.clear_all();
        self.input.clear();
        control.needs_rearm = false;
        self.stream().format = None;
    }

    pub fn current_format(&self) -> Option<OutputFormat> {
        self.stream().format.clone()
    }

    pub fn component_name(&self) -> String {
        self.stream().component.clone()
    }

    pub fn output_buffer_count(&self) -> usize {
        self.output.size()
    }

    pub fn output_capacity(&self) -> usize {
        self.output.capacity()
    }

    /// Marks a break in the input; the worker drops it in order.
    pub fn signal_discontinuity(&self) -> bool {
        self.input.push(Frame::sentinel(FrameStatus::Discontinuity))
    }

    pub fn worker_state(&self) -> WorkerState {
        self.shared.state()
    }

    /// Detaches the surface from the pipeline and hands it back disconnected.
    pub fn take_surface(&self) -> Option<Box<dyn Surface>> {
        self.renderer().take().and_then(Renderer::into_surface)
    }
}

impl Drop for PipelineFacade {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
