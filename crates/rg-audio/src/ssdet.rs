//! Stream state detector

use std::collections::VecDeque;

use rg_core::Sample;

use crate::graph::AudioSink;

/// Activity transitions emitted by the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    Activated,
    Idled,
}

/// Forwards audio while tracking stream activity. The stream counts as
/// active from the first write; it goes idle when flushed, after the
/// configured hangover (default immediate). Transitions are queued for the
/// owner to drain.
pub struct StreamStateDetector {
    out: Option<Box<dyn AudioSink>>,
    active: bool,
    hangover_ms: u64,
    idle_deadline: Option<u64>,
    awaiting_deadline: bool,
    events: VecDeque<StreamEvent>,
}

impl StreamStateDetector {
    pub fn new(hangover_ms: u64) -> Self {
        Self {
            out: None,
            active: false,
            hangover_ms,
            idle_deadline: None,
            awaiting_deadline: false,
            events: VecDeque::new(),
        }
    }

    pub fn set_output(&mut self, out: Box<dyn AudioSink>) {
        self.out = Some(out);
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_idle(&self) -> bool {
        !self.active
    }

    pub fn take_events(&mut self) -> Vec<StreamEvent> {
        self.events.drain(..).collect()
    }

    /// Resolve a pending hangover. Call once per loop iteration.
    pub fn tick(&mut self, now_ms: u64) {
        if self.awaiting_deadline {
            self.idle_deadline = Some(now_ms + self.hangover_ms);
            self.awaiting_deadline = false;
        }
        if let Some(deadline) = self.idle_deadline
            && now_ms >= deadline
        {
            self.idle_deadline = None;
            if self.active {
                self.active = false;
                self.events.push_back(StreamEvent::Idled);
            }
        }
    }

    pub fn deadline(&self) -> Option<u64> {
        self.idle_deadline
    }
}

impl AudioSink for StreamStateDetector {
    fn write(&mut self, samples: &[Sample]) {
        self.idle_deadline = None;
        self.awaiting_deadline = false;
        if !self.active {
            self.active = true;
            self.events.push_back(StreamEvent::Activated);
        }
        if let Some(out) = self.out.as_mut() {
            out.write(samples);
        }
    }

    fn flush(&mut self) {
        if self.active {
            if self.hangover_ms == 0 {
                self.active = false;
                self.events.push_back(StreamEvent::Idled);
            } else {
                // Deadline is anchored at the next tick
                self.awaiting_deadline = true;
            }
        }
        if let Some(out) = self.out.as_mut() {
            out.flush();
        }
    }
}
