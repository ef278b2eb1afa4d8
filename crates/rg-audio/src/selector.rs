//! Priority fan-in selector

use std::sync::Arc;

use parking_lot::Mutex;
use rg_core::Sample;

use crate::graph::AudioSink;

struct SourceState {
    prio: i32,
    autoselect: bool,
    streaming: bool,
}

struct SelectorInner {
    sources: Vec<SourceState>,
    selected: Option<usize>,
    out: Option<Box<dyn AudioSink>>,
}

impl SelectorInner {
    fn reselect(&mut self) {
        // Highest priority streaming autoselect source; ties broken by
        // registration order.
        let mut best: Option<usize> = None;
        for (idx, src) in self.sources.iter().enumerate() {
            if !src.streaming || !src.autoselect {
                continue;
            }
            match best {
                Some(b) if self.sources[b].prio >= src.prio => {}
                _ => best = Some(idx),
            }
        }
        self.selected = best;
    }

    fn write_from(&mut self, idx: usize, samples: &[Sample]) {
        self.sources[idx].streaming = true;
        match self.selected {
            Some(sel) if sel == idx => {}
            Some(sel) => {
                // A higher priority autoselect source grabs the output
                if self.sources[idx].autoselect && self.sources[idx].prio > self.sources[sel].prio
                {
                    self.selected = Some(idx);
                } else {
                    return;
                }
            }
            None => {
                if !self.sources[idx].autoselect {
                    return;
                }
                self.selected = Some(idx);
            }
        }
        if let Some(out) = self.out.as_mut() {
            out.write(samples);
        }
    }

    fn flush_from(&mut self, idx: usize) {
        self.sources[idx].streaming = false;
        if self.selected == Some(idx) {
            self.reselect();
            if self.selected.is_none()
                && let Some(out) = self.out.as_mut()
            {
                out.flush();
            }
        }
    }
}

/// Fan-in node: among the registered sources, audio from the highest
/// priority currently-streaming source is routed to the output. Sources
/// with autoselect grab the output on activity; others must be selected
/// explicitly.
pub struct Selector {
    inner: Arc<Mutex<SelectorInner>>,
}

impl Selector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SelectorInner {
                sources: Vec::new(),
                selected: None,
                out: None,
            })),
        }
    }

    pub fn set_output(&self, out: Box<dyn AudioSink>) {
        self.inner.lock().out = Some(out);
    }

    /// Register a source; the returned port is the sink to feed it through
    pub fn add_source(&self, prio: i32, autoselect: bool) -> SelectorPort {
        let mut inner = self.inner.lock();
        inner.sources.push(SourceState {
            prio,
            autoselect,
            streaming: false,
        });
        SelectorPort {
            inner: self.inner.clone(),
            idx: inner.sources.len() - 1,
        }
    }

    /// Force-select a source regardless of autoselect
    pub fn select_source(&self, port: &SelectorPort) {
        self.inner.lock().selected = Some(port.idx);
    }

    /// Index of the currently selected source, if any
    pub fn selected(&self) -> Option<usize> {
        self.inner.lock().selected
    }
}

impl Default for Selector {
    fn default() -> Self {
        Self::new()
    }
}

/// Write side of one selector source
pub struct SelectorPort {
    inner: Arc<Mutex<SelectorInner>>,
    idx: usize,
}

impl AudioSink for SelectorPort {
    fn write(&mut self, samples: &[Sample]) {
        self.inner.lock().write_from(self.idx, samples);
    }

    fn flush(&mut self) {
        self.inner.lock().flush_from(self.idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Collector, shared};

    #[test]
    fn test_single_source_routes() {
        let sink = shared(Collector::new());
        let sel = Selector::new();
        sel.set_output(Box::new(sink.clone()));
        let mut port = sel.add_source(0, true);
        port.write(&[1, 2]);
        port.flush();
        assert_eq!(sink.lock().take_all(), vec![1, 2]);
        assert!(sink.lock().stream_done());
    }

    #[test]
    fn test_higher_priority_grabs() {
        let sink = shared(Collector::new());
        let sel = Selector::new();
        sel.set_output(Box::new(sink.clone()));
        let mut low = sel.add_source(0, true);
        let mut high = sel.add_source(10, true);

        low.write(&[1]);
        high.write(&[2]);
        low.write(&[3]); // ignored while high streams
        assert_eq!(sink.lock().take_all(), vec![1, 2]);

        high.flush();
        low.write(&[4]); // low is still streaming, takes over
        assert_eq!(sink.lock().take_all(), vec![4]);
    }

    #[test]
    fn test_tie_broken_by_registration_order() {
        let sink = shared(Collector::new());
        let sel = Selector::new();
        sel.set_output(Box::new(sink.clone()));
        let mut first = sel.add_source(5, true);
        let mut second = sel.add_source(5, true);

        first.write(&[1]);
        second.write(&[2]); // equal priority does not preempt
        assert_eq!(sink.lock().take_all(), vec![1]);
        assert_eq!(sel.selected(), Some(0));
    }

    #[test]
    fn test_flush_forwarded_when_no_source_left() {
        let sink = shared(Collector::new());
        let sel = Selector::new();
        sel.set_output(Box::new(sink.clone()));
        let mut a = sel.add_source(0, true);
        a.write(&[1]);
        a.flush();
        assert!(sink.lock().stream_done());
        assert_eq!(sel.selected(), None);
    }

    #[test]
    fn test_non_autoselect_needs_manual_selection() {
        let sink = shared(Collector::new());
        let sel = Selector::new();
        sel.set_output(Box::new(sink.clone()));
        let mut port = sel.add_source(0, false);
        port.write(&[1]);
        assert!(sink.lock().is_empty());
        sel.select_source(&port);
        port.write(&[2]);
        assert_eq!(sink.lock().take_all(), vec![2]);
    }
}
