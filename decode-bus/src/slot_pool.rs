//! Fixed-capacity output pool shared by the decode worker and the consumer.
//!
//! The worker publishes decoded frames into free slots, stamping each with an arrival number.
//! The consumer always holds the oldest published slot, so delivery follows publish order no
//! matter which physical slot a frame landed in. External buffers released by the consumer
//! are parked on a deferred list and handed back to the engine outside the lock.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use crate::frame::{ExternalBuffer, Frame, FrameView};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Sequenced(u64),
    Held,
}

/// Result of a non-blocking query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Snapshot {
    Count(usize),
    Contended,
}

struct Slot {
    frame: Frame,
    state: SlotState,
}

struct PoolInner {
    slots: Vec<Slot>,
    next_seq: u64,
    deferred: Vec<ExternalBuffer>,
    closed: bool,
}

impl PoolInner {
    fn free_index(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.state == SlotState::Free)
    }

    fn oldest_sequenced(&self) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s.state {
                SlotState::Sequenced(n) => Some((n, i)),
                _ => None,
            })
            .min()
            .map(|(_, i)| i)
    }

    fn ready_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s.state, SlotState::Sequenced(_)))
            .count()
    }

    fn filled_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state != SlotState::Free && !s.frame.is_empty())
            .count()
    }

    fn free_slot(&mut self, index: usize) {
        let Self { slots, deferred, .. } = self;
        let slot = &mut slots[index];
        slot.frame.release(Some(deferred));
        slot.frame = Frame::empty();
        slot.state = SlotState::Free;
    }
}

/// Time remaining until `deadline`, or None once it has passed. A missing deadline
/// (timeout too large to represent) never expires.
pub(crate) fn time_left(deadline: Option<Instant>) -> Option<Duration> {
    match deadline {
        Some(deadline) => deadline
            .checked_duration_since(Instant::now())
            .filter(|left| !left.is_zero()),
        None => Some(Duration::MAX),
    }
}

pub struct SlotPool {
    inner: Mutex<PoolInner>,
    /// A slot became free or the pool closed.
    freed: Condvar,
    /// A sequenced slot was taken by the consumer or dropped.
    held: Condvar,
    /// A frame was published.
    ready: Condvar,
    capacity: usize,
    max_in_flight: usize,
    block_when_full: bool,
}

impl SlotPool {
    pub fn new(capacity: usize, max_in_flight: usize, block_when_full: bool) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                frame: Frame::empty(),
                state: SlotState::Free,
            })
            .collect();
        Self {
            inner: Mutex::new(PoolInner {
                slots,
                next_seq: 0,
                deferred: Vec::new(),
                closed: false,
            }),
            freed: Condvar::new(),
            held: Condvar::new(),
            ready: Condvar::new(),
            capacity,
            max_in_flight: max_in_flight.min(capacity),
            block_when_full,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `frame` in a free slot and returns the slot index.
    ///
    /// With `wait`, returns only after the consumer has held (or the pool dropped) the frame,
    /// or the pool was closed. The frame comes back in `Err` when it could not be stored.
    pub fn publish(&self, mut frame: Frame, wait: bool) -> Result<usize, Frame> {
        let mut inner = self.lock();
        let index = loop {
            if inner.closed {
                return Err(frame);
            }
            if let Some(index) = inner.free_index() {
                break index;
            }
            if !self.block_when_full {
                return Err(frame);
            }
            inner = self
                .freed
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        };

        let seq = inner.next_seq;
        inner.next_seq += 1;
        let slot = &mut inner.slots[index];
        slot.frame.swap(&mut frame);
        slot.state = SlotState::Sequenced(seq);
        self.ready.notify_all();

        if wait {
            while !inner.closed && inner.slots[index].state == SlotState::Sequenced(seq) {
                inner = self
                    .held
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        Ok(index)
    }

    /// Marks the oldest published slot as held by the consumer.
    pub fn hold_next(&self) -> Option<(usize, FrameView)> {
        let mut inner = self.lock();
        let index = inner.oldest_sequenced()?;
        let slot = &mut inner.slots[index];
        slot.state = SlotState::Held;
        let view = slot.frame.view();
        self.held.notify_all();
        Some((index, view))
    }

    /// Frees a held slot. External payloads go on the deferred list.
    pub fn release(&self, index: usize) -> bool {
        let mut inner = self.lock();
        match inner.slots.get(index).map(|s| s.state) {
            Some(SlotState::Held) => {
                inner.free_slot(index);
                self.freed.notify_all();
                true
            }
            state => {
                log::warn!("release of slot {} in state {:?} ignored", index, state);
                false
            }
        }
    }

    /// Takes ownership of a held slot's frame and frees the slot.
    pub fn pull(&self, index: usize) -> Option<Frame> {
        let mut inner = self.lock();
        match inner.slots.get(index).map(|s| s.state) {
            Some(SlotState::Held) => {
                let slot = &mut inner.slots[index];
                let frame = std::mem::take(&mut slot.frame);
                slot.state = SlotState::Free;
                self.freed.notify_all();
                Some(frame)
            }
            state => {
                log::warn!("pull of slot {} in state {:?} ignored", index, state);
                None
            }
        }
    }

    /// Hands every deferred external buffer back to its owner.
    pub fn drain_deferred(&self) -> usize {
        let deferred = std::mem::take(&mut self.lock().deferred);
        let count = deferred.len();
        for buffer in deferred {
            buffer.release();
        }
        count
    }

    /// Frees every slot the consumer is not holding.
    pub fn clear_all(&self) -> usize {
        let cleared = {
            let mut inner = self.lock();
            let indices: Vec<usize> = inner
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| matches!(s.state, SlotState::Sequenced(_)))
                .map(|(i, _)| i)
                .collect();
            for &index in &indices {
                inner.free_slot(index);
            }
            if !indices.is_empty() {
                self.freed.notify_all();
                self.held.notify_all();
            }
            indices.len()
        };
        self.drain_deferred();
        cleared
    }

    /// Drops the oldest frame the consumer has not picked up yet.
    pub fn discard_oldest_ready(&self) -> bool {
        let discarded = {
            let mut inner = self.lock();
            match inner.oldest_sequenced() {
                Some(index) => {
                    log::debug!("discarding oldest ready slot {}", index);
                    inner.free_slot(index);
                    self.freed.notify_all();
                    self.held.notify_all();
                    true
                }
                None => false,
            }
        };
        self.drain_deferred();
        discarded
    }

    /// Waits until fewer than `max_in_flight` slots carry a payload, up to `budget`.
    /// Returns the payload-carrying slot count at exit.
    pub fn wait_for_drain(&self, budget: Duration) -> usize {
        let deadline = Instant::now().checked_add(budget);
        let mut inner = self.lock();
        loop {
            let filled = inner.filled_count();
            if filled < self.max_in_flight || inner.closed {
                return filled;
            }
            let Some(left) = time_left(deadline) else {
                return filled;
            };
            inner = self
                .freed
                .wait_timeout(inner, left)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Consumer-side wait for at least one published slot.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut inner = self.lock();
        loop {
            if inner.ready_count() > 0 {
                return true;
            }
            if inner.closed {
                return false;
            }
            let Some(left) = time_left(deadline) else {
                return false;
            };
            inner = self
                .ready
                .wait_timeout(inner, left)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Slots not free.
    pub fn size(&self) -> usize {
        self.lock()
            .slots
            .iter()
            .filter(|s| s.state != SlotState::Free)
            .count()
    }

    pub fn ready_count(&self) -> usize {
        self.lock().ready_count()
    }

    pub fn filled_count(&self) -> usize {
        self.lock().filled_count()
    }

    pub fn try_ready_count(&self) -> Snapshot {
        match self.inner.try_lock() {
            Ok(inner) => Snapshot::Count(inner.ready_count()),
            Err(TryLockError::Poisoned(poisoned)) => {
                Snapshot::Count(poisoned.into_inner().ready_count())
            }
            Err(TryLockError::WouldBlock) => Snapshot::Contended,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    pub fn state(&self, index: usize) -> Option<SlotState> {
        self.lock().slots.get(index).map(|s| s.state)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Wakes every blocked publisher and refuses further publishes.
    pub fn close(&self) {
        self.lock().closed = true;
        self.freed.notify_all();
        self.held.notify_all();
        self.ready.notify_all();
    }
}

#[cfg(test)]
#[path = "slot_pool_test.rs"]
mod slot_pool_test;
