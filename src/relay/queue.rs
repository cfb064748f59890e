//! Bounded per-session queue between the upstream reader and the client writer.
//!
//! ## Overload policy
//! When the queue is full:
//! - an incoming `interim` evicts the oldest queued `interim`, or is dropped
//!   itself if none is queued;
//! - an incoming `final`, `error` or `close` evicts the oldest queued `interim`
//!   if there is one, and is otherwise queued beyond the bound.
//!
//! `final` results are therefore never lost, and a slow client costs at most
//! `capacity` buffered interims plus whatever finals are in flight.
//!
//! The queue seals itself after a terminal event: later pushes are ignored and
//! `pop` returns `None` once the terminal event has been taken.

use crate::relay::event::TranscriptEvent;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<TranscriptEvent>,
    sealed: bool,
    dropped_interim: u64,
}

#[derive(Debug)]
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue an event. Returns `false` if it was not queued (sealed queue or
    /// interim shed under load).
    pub fn push(&self, event: TranscriptEvent) -> bool {
        let mut state = self.lock();
        if state.sealed {
            return false;
        }

        if state.items.len() >= self.capacity {
            let oldest_interim = state.items.iter().position(TranscriptEvent::is_droppable);
            match oldest_interim {
                Some(index) => {
                    state.items.remove(index);
                    state.dropped_interim += 1;
                }
                None if event.is_droppable() => {
                    state.dropped_interim += 1;
                    return false;
                }
                None => {}
            }
        }

        if event.is_terminal() {
            state.sealed = true;
        }
        state.items.push_back(event);
        drop(state);

        self.notify.notify_one();
        true
    }

    /// Seal without a terminal event; `pop` drains what is queued, then ends.
    pub fn seal(&self) {
        self.lock().sealed = true;
        self.notify.notify_one();
    }

    #[cfg(test)]
    pub fn is_sealed(&self) -> bool {
        self.lock().sealed
    }

    /// Next event in upstream order, or `None` once sealed and drained.
    pub async fn pop(&self) -> Option<TranscriptEvent> {
        loop {
            // Registered before the check so a push in between is not missed.
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if let Some(event) = state.items.pop_front() {
                    return Some(event);
                }
                if state.sealed {
                    return None;
                }
            }
            notified.await;
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn dropped_interim(&self) -> u64 {
        self.lock().dropped_interim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn transcripts(queue: &OutboundQueue) -> Vec<String> {
        queue.lock().items.iter().map(|e| e.transcript().to_string()).collect()
    }

    #[test]
    fn test_full_queue_evicts_oldest_interim() {
        let queue = OutboundQueue::new(3);
        queue.push(TranscriptEvent::interim("a"));
        queue.push(TranscriptEvent::final_result("b"));
        queue.push(TranscriptEvent::interim("c"));

        assert!(queue.push(TranscriptEvent::interim("d")));
        assert_eq!(transcripts(&queue), vec!["b", "c", "d"]);
        assert_eq!(queue.dropped_interim(), 1);
    }

    #[test]
    fn test_finals_are_never_dropped() {
        let queue = OutboundQueue::new(2);
        queue.push(TranscriptEvent::final_result("one"));
        queue.push(TranscriptEvent::final_result("two"));

        // No interim left to evict: the new interim is shed, the final overflows.
        assert!(!queue.push(TranscriptEvent::interim("shed")));
        assert!(queue.push(TranscriptEvent::final_result("three")));

        assert_eq!(transcripts(&queue), vec!["one", "two", "three"]);
        assert_eq!(queue.dropped_interim(), 1);
    }

    #[test]
    fn test_terminal_event_seals_queue() {
        let queue = OutboundQueue::new(4);
        queue.push(TranscriptEvent::close("upstream_closed"));
        assert!(queue.is_sealed());
        assert!(!queue.push(TranscriptEvent::final_result("late")));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(OutboundQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(event) = queue.pop().await {
                    seen.push(event.kind());
                }
                seen
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(TranscriptEvent::interim("x"));
        queue.push(TranscriptEvent::final_result("x y"));
        queue.push(TranscriptEvent::close("upstream_closed"));

        assert_eq!(consumer.await.unwrap(), vec!["interim", "final", "close"]);
    }

    #[tokio::test]
    async fn test_seal_drains_then_ends() {
        let queue = OutboundQueue::new(4);
        queue.push(TranscriptEvent::interim("a"));
        queue.seal();

        assert_eq!(queue.pop().await, Some(TranscriptEvent::interim("a")));
        assert_eq!(queue.pop().await, None);
    }
}
