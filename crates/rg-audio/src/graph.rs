//! Audio sink trait and trivial nodes

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rg_core::Sample;

/// A consumer of pushed audio blocks. `flush` marks end-of-stream and must
/// be propagated downstream; a sink receiving `flush` with buffered samples
/// delivers them before going idle.
pub trait AudioSink: Send {
    fn write(&mut self, samples: &[Sample]);
    fn flush(&mut self);
}

/// Wrap a node for shared wiring. A cloned handle implements `AudioSink`
/// itself, so one node can feed another while its owner keeps a typed
/// handle for control (valve open/close, branch enables, ...).
pub fn shared<T: AudioSink>(node: T) -> Arc<Mutex<T>> {
    Arc::new(Mutex::new(node))
}

impl<T: AudioSink> AudioSink for Arc<Mutex<T>> {
    fn write(&mut self, samples: &[Sample]) {
        self.lock().write(samples);
    }

    fn flush(&mut self) {
        self.lock().flush();
    }
}

/// Discards everything
#[derive(Default)]
pub struct NullSink;

impl AudioSink for NullSink {
    fn write(&mut self, _samples: &[Sample]) {}
    fn flush(&mut self) {}
}

/// Forwards samples and flush unmodified
#[derive(Default)]
pub struct Passthrough {
    out: Option<Box<dyn AudioSink>>,
}

impl Passthrough {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_output(&mut self, out: Box<dyn AudioSink>) {
        self.out = Some(out);
    }
}

impl AudioSink for Passthrough {
    fn write(&mut self, samples: &[Sample]) {
        if let Some(out) = self.out.as_mut() {
            out.write(samples);
        }
    }

    fn flush(&mut self) {
        if let Some(out) = self.out.as_mut() {
            out.flush();
        }
    }
}

/// Terminal sink buffering everything it receives. Used as the hand-off
/// point where the event loop pulls audio out of a graph, and in tests.
#[derive(Default)]
pub struct Collector {
    buf: VecDeque<Sample>,
    flushed: bool,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain up to `max` buffered samples
    pub fn take(&mut self, max: usize) -> Vec<Sample> {
        let n = max.min(self.buf.len());
        self.buf.drain(..n).collect()
    }

    pub fn take_all(&mut self) -> Vec<Sample> {
        self.buf.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// True once a flush has arrived and everything before it was drained
    pub fn stream_done(&self) -> bool {
        self.flushed && self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.flushed = false;
    }
}

impl AudioSink for Collector {
    fn write(&mut self, samples: &[Sample]) {
        self.flushed = false;
        self.buf.extend(samples.iter().copied());
    }

    fn flush(&mut self) {
        self.flushed = true;
    }
}
