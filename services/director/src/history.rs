//! Bounded in-memory rings of sent kanpe and received feedback.
//!
//! Older entries are discarded silently; consumers that need a durable
//! record must subscribe to the event stream live.

use bk_protocol::Envelope;
use std::collections::VecDeque;

#[derive(Debug)]
pub struct History {
    kanpe: VecDeque<Envelope>,
    feedback: VecDeque<Envelope>,
    /// Per-kind bound.
    capacity: usize,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            kanpe: VecDeque::with_capacity(capacity),
            feedback: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push_kanpe(&mut self, envelope: Envelope) {
        Self::push(&mut self.kanpe, envelope, self.capacity);
    }

    pub fn push_feedback(&mut self, envelope: Envelope) {
        Self::push(&mut self.feedback, envelope, self.capacity);
    }

    /// Oldest-first snapshot of sent kanpe.
    pub fn kanpe(&self) -> Vec<Envelope> {
        self.kanpe.iter().cloned().collect()
    }

    /// Oldest-first snapshot of received feedback.
    pub fn feedback(&self) -> Vec<Envelope> {
        self.feedback.iter().cloned().collect()
    }

    fn push(ring: &mut VecDeque<Envelope>, envelope: Envelope, capacity: usize) {
        ring.push_back(envelope);
        while ring.len() > capacity {
            ring.pop_front();
        }
    }
}
