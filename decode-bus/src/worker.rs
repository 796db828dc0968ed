//! The decode worker: one dedicated thread that pulls access units from the input stage,
//! feeds the engine and publishes whatever comes back into the output pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::engine::{AccessUnit, DecodeEngine, DecodedOutput, Retrieved};
use crate::format;
use crate::frame::{BufferRelease, ExternalBuffer, Frame, FrameFlags, FrameStatus};
use crate::input_stage::InputStage;
use crate::mime::MediaKind;
use crate::pipeline::StreamState;
use crate::slot_pool::SlotPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerState {
    #[default]
    Idle,
    Running,
    Draining,
    Stopped,
}

/// State shared between the worker thread and the facade.
pub struct WorkerShared {
    pub input: Arc<InputStage>,
    pub output: Arc<SlotPool>,
    pub stream: Arc<Mutex<StreamState>>,
    pub config: PipelineConfig,
    /// A flush is in progress; end-of-stream is published with a hold-wait.
    pub flush_pending: AtomicBool,
    /// The producer timed out waiting for input space.
    pub input_pressure: AtomicBool,
    state: Mutex<WorkerState>,
    fatal: Mutex<Option<String>>,
}

impl WorkerShared {
    pub fn new(
        input: Arc<InputStage>,
        output: Arc<SlotPool>,
        stream: Arc<Mutex<StreamState>>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            input,
            output,
            stream,
            config,
            flush_pending: AtomicBool::new(false),
            input_pressure: AtomicBool::new(false),
            state: Mutex::new(WorkerState::Idle),
            fatal: Mutex::new(None),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: WorkerState) {
        let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != state {
            log::debug!("decode worker {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_fatal(&self, message: String) {
        *self.fatal.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
    }

    /// Prepares the shared flags for a fresh worker after a flush.
    pub fn rearm(&self) {
        self.flush_pending.store(false, Ordering::SeqCst);
        self.input_pressure.store(false, Ordering::SeqCst);
        self.set_state(WorkerState::Idle);
    }
}

pub struct DecodeWorker {
    shared: Arc<WorkerShared>,
    engine: Box<dyn DecodeEngine>,
    owner: Arc<dyn BufferRelease>,
    cancel: CancellationToken,
    kind: MediaKind,
    skip_armed: bool,
    submit_failures: u32,
}

impl DecodeWorker {
    pub fn new(
        shared: Arc<WorkerShared>,
        engine: Box<dyn DecodeEngine>,
        cancel: CancellationToken,
        kind: MediaKind,
    ) -> Self {
        let owner = engine.buffer_owner();
        Self {
            shared,
            engine,
            owner,
            cancel,
            kind,
            skip_armed: false,
            submit_failures: 0,
        }
    }

    /// Starts the worker thread. Joining it gives the engine back for re-arming.
    pub fn spawn(self) -> std::io::Result<JoinHandle<Box<dyn DecodeEngine>>> {
        self.shared.input.attach();
        self.shared.set_state(WorkerState::Running);
        std::thread::Builder::new()
            .name("decode-worker".to_string())
            .spawn(move || self.run())
    }

    fn run(mut self) -> Box<dyn DecodeEngine> {
        log::info!("decode worker started");
        let mut current = Frame::empty();

        while !self.cancel.is_cancelled() {
            self.shared.output.drain_deferred();

            current.release(None);
            current = Frame::empty();
            let status = self.shared.input.wait_and_pop(&mut current);
            if self.cancel.is_cancelled() {
                break;
            }

            let draining = match status {
                FrameStatus::Ok if current.is_empty() => {
                    if self.shared.input.is_interrupted() {
                        break;
                    }
                    continue;
                }
                FrameStatus::Ok => {
                    if !self.submit_unit(&current) {
                        break;
                    }
                    false
                }
                FrameStatus::EndOfStream => {
                    self.shared.set_state(WorkerState::Draining);
                    if let Err(err) = self.engine.submit(AccessUnit::EndOfStream) {
                        log::warn!("failed to signal end of stream to engine: {:#}", err);
                    }
                    true
                }
                FrameStatus::Discontinuity => {
                    log::debug!("dropping input discontinuity");
                    continue;
                }
                other => {
                    log::debug!("dropping input sentinel {:?}", other);
                    continue;
                }
            };

            if self.drain_engine(draining) {
                break;
            }
        }

        current.release(None);
        if self.cancel.is_cancelled() || self.shared.input.is_interrupted() {
            self.shared.output.clear_all();
        } else {
            self.shared.output.drain_deferred();
        }
        self.shared.set_state(WorkerState::Stopped);
        log::info!("decode worker stopped");
        self.engine
    }

    /// Returns false when the worker has to stop.
    fn submit_unit(&mut self, frame: &Frame) -> bool {
        let Some(payload) = frame.data().cloned() else {
            return true;
        };
        let unit = AccessUnit::Data {
            payload,
            timestamp: frame.timestamp(),
            flags: frame.flags(),
        };
        match self.engine.submit(unit) {
            Ok(()) => {
                self.submit_failures = 0;
                true
            }
            Err(err) => {
                self.submit_failures += 1;
                log::warn!(
                    "submit failed ({}/{}): {:#}",
                    self.submit_failures,
                    self.shared.config.max_submit_failures,
                    err
                );
                if self.submit_failures >= self.shared.config.max_submit_failures {
                    self.shared.set_fatal(format!("{:#}", err));
                    return false;
                }
                true
            }
        }
    }

    /// Retrieves until the engine has nothing more. Returns true once end-of-stream was published.
    fn drain_engine(&mut self, draining: bool) -> bool {
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            match self.engine.retrieve() {
                Retrieved::TryAgain if draining => {
                    std::thread::sleep(self.shared.config.poll_slice());
                }
                Retrieved::TryAgain => return false,
                Retrieved::Decoded {
                    output,
                    timestamp,
                    flags,
                } => self.deliver(output, timestamp, flags),
                Retrieved::FormatChanged => self.on_format_changed(),
                Retrieved::EndOfStream => {
                    self.publish_end_of_stream();
                    return true;
                }
                Retrieved::Discontinuity => {
                    log::debug!("engine reported discontinuity");
                }
                Retrieved::Error(code) => {
                    log::warn!("transient decode error {}, clearing output", code);
                    self.shared.output.clear_all();
                    std::thread::sleep(self.shared.config.error_backoff());
                }
            }
        }
    }

    fn deliver(&mut self, output: DecodedOutput, timestamp: i64, flags: FrameFlags) {
        let mut frame = match output {
            DecodedOutput::Bytes(data) => {
                Frame::from_owned(FrameStatus::Ok, data, timestamp, flags)
            }
            DecodedOutput::External(id) => Frame::from_external(
                FrameStatus::Ok,
                ExternalBuffer::new(id, self.owner.clone()),
                timestamp,
                flags,
            ),
        };
        if timestamp < 0 {
            log::debug!("dropping output with negative timestamp {}", timestamp);
            frame.release(None);
            return;
        }

        let zero_copy = frame.is_external();
        let pressure = self.shared.input_pressure.load(Ordering::SeqCst);
        if zero_copy && self.skip_armed && pressure {
            log::debug!("input under pressure, skipping frame at {}", timestamp);
            frame.release(None);
            self.skip_armed = false;
            return;
        }

        let pool = &self.shared.output;
        if pool.filled_count() >= pool.max_in_flight() {
            let flushing = self.shared.flush_pending.load(Ordering::SeqCst);
            let filled = pool.wait_for_drain(self.shared.config.drain_budget(flushing));
            if filled >= pool.max_in_flight() {
                log::debug!("consumer is behind ({} in flight), discarding oldest", filled);
                pool.discard_oldest_ready();
                self.skip_armed = true;
            }
        }

        if let Err(mut rejected) = pool.publish(frame, zero_copy && !pressure) {
            log::debug!("output pool rejected frame at {}", timestamp);
            rejected.release(None);
        }
        if zero_copy {
            self.skip_armed = true;
        }
    }

    fn on_format_changed(&mut self) {
        let Some(negotiated) = self.engine.negotiated_format() else {
            log::warn!("format change without a negotiated format");
            return;
        };
        {
            let mut stream = self.shared.stream.lock().unwrap_or_else(PoisonError::into_inner);
            match format::resolve(self.kind, &negotiated) {
                Ok((format, component)) => {
                    log::info!("output format changed: {:?}", format);
                    stream.format = Some(format);
                    stream.component = component;
                }
                Err(err) => {
                    log::warn!("ignoring unusable format change: {}", err);
                    return;
                }
            }
        }
        if self
            .shared
            .output
            .publish(Frame::sentinel(FrameStatus::FormatChanged), false)
            .is_err()
        {
            log::warn!("could not publish format change");
        }
    }

    fn publish_end_of_stream(&mut self) {
        let wait = self.shared.flush_pending.load(Ordering::SeqCst);
        if self
            .shared
            .output
            .publish(Frame::sentinel(FrameStatus::EndOfStream), wait)
            .is_err()
        {
            log::warn!("could not publish end of stream");
        }
    }
}

#[cfg(test)]
#[path = "worker_test.rs"]
mod worker_test;
