//! Gatable passthrough

use rg_core::Sample;

use crate::graph::AudioSink;

/// Like a passthrough, but writes are discarded while closed. Closing the
/// valve mid-stream flushes the downstream side so no sink is left waiting
/// on a stream that will never end.
pub struct Valve {
    open: bool,
    stream_active: bool,
    out: Option<Box<dyn AudioSink>>,
}

impl Valve {
    pub fn new(open: bool) -> Self {
        Self {
            open,
            stream_active: false,
            out: None,
        }
    }

    pub fn set_output(&mut self, out: Box<dyn AudioSink>) {
        self.out = Some(out);
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn set_open(&mut self, open: bool) {
        if self.open == open {
            return;
        }
        self.open = open;
        if !open && self.stream_active {
            if let Some(out) = self.out.as_mut() {
                out.flush();
            }
            self.stream_active = false;
        }
    }
}

impl AudioSink for Valve {
    fn write(&mut self, samples: &[Sample]) {
        if self.open {
            self.stream_active = true;
            if let Some(out) = self.out.as_mut() {
                out.write(samples);
            }
        }
    }

    fn flush(&mut self) {
        if self.open {
            if let Some(out) = self.out.as_mut() {
                out.flush();
            }
        }
        self.stream_active = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Collector, shared};

    #[test]
    fn test_closed_valve_drops_samples() {
        let sink = shared(Collector::new());
        let mut valve = Valve::new(false);
        valve.set_output(Box::new(sink.clone()));
        valve.write(&[1, 2, 3]);
        assert!(sink.lock().is_empty());
    }

    #[test]
    fn test_open_valve_forwards() {
        let sink = shared(Collector::new());
        let mut valve = Valve::new(true);
        valve.set_output(Box::new(sink.clone()));
        valve.write(&[1, 2, 3]);
        assert_eq!(sink.lock().take_all(), vec![1, 2, 3]);
    }

    #[test]
    fn test_close_mid_stream_flushes_downstream() {
        let sink = shared(Collector::new());
        let mut valve = Valve::new(true);
        valve.set_output(Box::new(sink.clone()));
        valve.write(&[1, 2]);
        valve.set_open(false);
        assert!(sink.lock().stream_done());
        valve.write(&[3, 4]);
        assert!(sink.lock().is_empty());
    }
}
