//! Fan-out splitter

use rg_core::Sample;

use crate::graph::AudioSink;

/// Identifies one splitter branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchId(usize);

struct Branch {
    sink: Box<dyn AudioSink>,
    enabled: bool,
}

/// Broadcasts to every enabled branch. A disabled branch receives neither
/// samples nor flush; disabling a branch mid-stream flushes it.
#[derive(Default)]
pub struct Splitter {
    branches: Vec<Branch>,
    stream_active: bool,
}

impl Splitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&mut self, sink: Box<dyn AudioSink>) -> BranchId {
        self.branches.push(Branch {
            sink,
            enabled: true,
        });
        BranchId(self.branches.len() - 1)
    }

    pub fn is_enabled(&self, id: BranchId) -> bool {
        self.branches[id.0].enabled
    }

    pub fn enable_sink(&mut self, id: BranchId, enable: bool) {
        let branch = &mut self.branches[id.0];
        if branch.enabled == enable {
            return;
        }
        branch.enabled = enable;
        if !enable && self.stream_active {
            branch.sink.flush();
        }
    }
}

impl AudioSink for Splitter {
    fn write(&mut self, samples: &[Sample]) {
        self.stream_active = true;
        for branch in self.branches.iter_mut().filter(|b| b.enabled) {
            branch.sink.write(samples);
        }
    }

    fn flush(&mut self) {
        self.stream_active = false;
        for branch in self.branches.iter_mut().filter(|b| b.enabled) {
            branch.sink.flush();
        }
    }
}
