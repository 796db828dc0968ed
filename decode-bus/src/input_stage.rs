//! Bounded FIFO between the producer and the decode worker.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::frame::{Frame, FrameStatus};
use crate::slot_pool::time_left;

struct StageInner {
    queue: VecDeque<Frame>,
    interrupted: bool,
    attached: bool,
}

pub struct InputStage {
    inner: Mutex<StageInner>,
    non_empty: Condvar,
    drained: Condvar,
    early_limit: usize,
}

impl InputStage {
    /// `early_limit` caps how many frames are accepted before a worker attaches.
    pub fn new(early_limit: usize) -> Self {
        Self {
            inner: Mutex::new(StageInner {
                queue: VecDeque::new(),
                interrupted: false,
                attached: false,
            }),
            non_empty: Condvar::new(),
            drained: Condvar::new(),
            early_limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StageInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, frame: Frame) -> bool {
        let mut inner = self.lock();
        if !inner.attached && inner.queue.len() >= self.early_limit {
            log::debug!("early input buffer full ({}), dropping frame", inner.queue.len());
            return false;
        }
        inner.queue.push_back(frame);
        self.non_empty.notify_one();
        true
    }

    /// Waits up to `timeout` for the queue to fall below `capacity`, then enqueues.
    /// On timeout the frame is handed back.
    pub fn push_bounded(
        &self,
        frame: Frame,
        capacity: usize,
        timeout: Duration,
    ) -> Result<usize, Frame> {
        let deadline = Instant::now().checked_add(timeout);
        let mut inner = self.lock();
        loop {
            if inner.interrupted {
                return Err(frame);
            }
            let limit = if inner.attached { capacity } else { self.early_limit };
            if inner.queue.len() < limit {
                break;
            }
            if !inner.attached {
                return Err(frame);
            }
            let Some(left) = time_left(deadline) else {
                return Err(frame);
            };
            inner = self
                .drained
                .wait_timeout(inner, left)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        inner.queue.push_back(frame);
        self.non_empty.notify_one();
        Ok(inner.queue.len())
    }

    /// Blocks until a frame is available or the stage is interrupted.
    ///
    /// On interrupt with nothing queued `out` is left as it was and its status is returned.
    pub fn wait_and_pop(&self, out: &mut Frame) -> FrameStatus {
        let mut inner = self.lock();
        loop {
            if let Some(mut frame) = inner.queue.pop_front() {
                self.drained.notify_all();
                out.swap(&mut frame);
                return out.status();
            }
            if inner.interrupted {
                return out.status();
            }
            inner = self
                .non_empty
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Queues an end-of-stream sentinel regardless of limits.
    pub fn signal_end_of_stream(&self) {
        let mut inner = self.lock();
        inner.queue.push_back(Frame::sentinel(FrameStatus::EndOfStream));
        self.non_empty.notify_all();
    }

    pub fn interrupt(&self) {
        self.lock().interrupted = true;
        self.non_empty.notify_all();
        self.drained.notify_all();
    }

    pub fn is_interrupted(&self) -> bool {
        self.lock().interrupted
    }

    pub fn clear(&self) -> usize {
        let dropped: Vec<Frame> = self.lock().queue.drain(..).collect();
        self.drained.notify_all();
        dropped.len()
    }

    pub fn attach(&self) {
        self.lock().attached = true;
    }

    pub fn is_attached(&self) -> bool {
        self.lock().attached
    }

    /// Clears the interrupt flag for a new worker. Queued input is kept.
    pub fn reset(&self) {
        self.lock().interrupted = false;
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
