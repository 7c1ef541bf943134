//! Bounded per-connection outbound queue.
//!
//! Producers never wait: when the queue is full the oldest pending frame is
//! evicted to make room. A slow client therefore loses stale events (which it
//! can recover through `GetMessages`) instead of stalling the router or
//! growing memory without bound.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest pending frame.
    DroppedOldest,
    /// The receiving side is gone; nothing was queued.
    Closed,
}

#[derive(Default)]
struct QueueState {
    frames: VecDeque<String>,
    closed: bool,
    dropped: u64,
}

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().expect("Mutex should not be poisoned")
    }

    fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }
}

/// Create a queue holding at most `capacity` frames (minimum 1).
pub fn outbound_queue(capacity: usize) -> (OutboundSender, OutboundReceiver) {
    let shared = Arc::new(Shared {
        state: Mutex::new(QueueState::default()),
        notify: Notify::new(),
    });
    (
        OutboundSender {
            shared: Arc::clone(&shared),
            capacity: capacity.max(1),
        },
        OutboundReceiver { shared },
    )
}

#[derive(Clone)]
pub struct OutboundSender {
    shared: Arc<Shared>,
    capacity: usize,
}

impl OutboundSender {
    pub fn push(&self, frame: String) -> PushOutcome {
        let outcome = {
            let mut state = self.shared.lock();
            if state.closed {
                return PushOutcome::Closed;
            }
            let outcome = if state.frames.len() >= self.capacity {
                state.frames.pop_front();
                state.dropped += 1;
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::Queued
            };
            state.frames.push_back(frame);
            outcome
        };
        self.shared.notify.notify_one();
        outcome
    }

    /// Stop accepting frames. The receiver still drains what is queued.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn len(&self) -> usize {
        self.shared.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames evicted so far.
    pub fn dropped(&self) -> u64 {
        self.shared.lock().dropped
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

pub struct OutboundReceiver {
    shared: Arc<Shared>,
}

impl OutboundReceiver {
    /// Next frame, or `None` once the queue is closed and drained.
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            {
                let mut state = self.shared.lock();
                if let Some(frame) = state.frames.pop_front() {
                    return Some(frame);
                }
                if state.closed {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }
}

impl Drop for OutboundReceiver {
    fn drop(&mut self) {
        self.shared.close();
    }
}
