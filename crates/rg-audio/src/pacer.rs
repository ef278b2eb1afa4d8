//! Real-time pacer

use std::collections::VecDeque;

use rg_core::Sample;

use crate::graph::AudioSink;

/// Buffers pushed audio and releases it downstream at the configured
/// sample rate, driven by the loop clock. Prevents a fast producer (file
/// playback, message synthesis) from flooding the TX path.
pub struct Pacer {
    sample_rate: u32,
    buf: VecDeque<Sample>,
    out: Option<Box<dyn AudioSink>>,
    last_ms: Option<u64>,
    carry_ms: u64,
    pending_flush: bool,
}

impl Pacer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            buf: VecDeque::new(),
            out: None,
            last_ms: None,
            carry_ms: 0,
            pending_flush: false,
        }
    }

    pub fn set_output(&mut self, out: Box<dyn AudioSink>) {
        self.out = Some(out);
    }

    /// Release the samples due since the previous tick
    pub fn tick(&mut self, now_ms: u64) {
        let last = match self.last_ms {
            Some(last) => last,
            None => {
                self.last_ms = Some(now_ms);
                return;
            }
        };
        let elapsed = now_ms.saturating_sub(last) + self.carry_ms;
        let due = (elapsed * self.sample_rate as u64 / 1000) as usize;
        // Carry the fraction of a sample period that has not elapsed yet
        self.carry_ms = elapsed - due as u64 * 1000 / self.sample_rate as u64;
        self.last_ms = Some(now_ms);

        if due > 0 && !self.buf.is_empty() {
            let n = due.min(self.buf.len());
            let block: Vec<Sample> = self.buf.drain(..n).collect();
            if let Some(out) = self.out.as_mut() {
                out.write(&block);
            }
        }
        if self.pending_flush && self.buf.is_empty() {
            self.pending_flush = false;
            if let Some(out) = self.out.as_mut() {
                out.flush();
            }
        }
    }

    pub fn samples_buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn is_idle(&self) -> bool {
        self.buf.is_empty() && !self.pending_flush
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.pending_flush = false;
    }
}

impl AudioSink for Pacer {
    fn write(&mut self, samples: &[Sample]) {
        self.pending_flush = false;
        self.buf.extend(samples.iter().copied());
    }

    fn flush(&mut self) {
        self.pending_flush = true;
    }
}
