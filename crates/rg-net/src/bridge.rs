//! Network audio bridge
//!
//! The common receive chain of every packet-voice and VoIP logic: a
//! jitter FIFO absorbing network timing, a preamp, a soft limiter and a
//! hard clipper. A flush timeout forces the stream closed if the far end
//! goes silent without ending its transmission.

use std::sync::Arc;

use parking_lot::Mutex;

use rg_audio::{
    AmplifierSink, AudioSink, ClipperSink, Collector, Fifo, LimiterSink, shared,
};
use rg_core::Sample;

pub const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 3000;

pub struct NetBridge {
    jitter_fifo: Fifo,
    chain_in: AmplifierSink,
    out: Arc<Mutex<Collector>>,
    stream_open: bool,
    last_audio_ms: u64,
    flush_timeout_ms: u64,
    flushed_by_timeout: bool,
}

impl NetBridge {
    /// `jitter_samples` of prebuffer, preamp in per-mille, limiter and
    /// clipper thresholds in sample units
    pub fn new(
        jitter_samples: usize,
        preamp_permille: i32,
        limiter_threshold: Sample,
        clipper_limit: Sample,
        flush_timeout_ms: u64,
    ) -> Self {
        let out = shared(Collector::new());
        let mut clipper = ClipperSink::new(clipper_limit);
        clipper.set_output(Box::new(out.clone()));
        let mut limiter = LimiterSink::new(limiter_threshold);
        limiter.set_output(Box::new(clipper));
        let mut chain_in = AmplifierSink::new(preamp_permille);
        chain_in.set_output(Box::new(limiter));
        Self {
            jitter_fifo: Fifo::new(jitter_samples, jitter_samples.max(1) * 16),
            chain_in,
            out,
            stream_open: false,
            last_audio_ms: 0,
            flush_timeout_ms,
            flushed_by_timeout: false,
        }
    }

    /// Samples arriving from the network
    pub fn write_net(&mut self, samples: &[Sample], now_ms: u64) {
        self.jitter_fifo.write(samples);
        self.stream_open = true;
        self.flushed_by_timeout = false;
        self.last_audio_ms = now_ms;
    }

    /// The far end ended its transmission
    pub fn end_of_stream(&mut self) {
        self.jitter_fifo.flush();
        self.stream_open = false;
    }

    pub fn is_active(&self) -> bool {
        self.stream_open
    }

    /// Pump buffered audio through the conditioning chain. Returns true
    /// when the flush timeout forced the stream closed this tick.
    pub fn tick(&mut self, now_ms: u64) -> bool {
        let mut buf = [0 as Sample; 1024];
        loop {
            let n = self.jitter_fifo.read(&mut buf);
            if n == 0 {
                break;
            }
            self.chain_in.write(&buf[..n]);
        }
        if self.jitter_fifo.stream_done() {
            self.chain_in.flush();
            self.jitter_fifo.ack_stream_done();
        }

        if self.stream_open
            && self.flush_timeout_ms > 0
            && now_ms.saturating_sub(self.last_audio_ms) >= self.flush_timeout_ms
        {
            self.end_of_stream();
            if self.jitter_fifo.stream_done() {
                self.chain_in.flush();
                self.jitter_fifo.ack_stream_done();
            }
            self.flushed_by_timeout = true;
            return true;
        }
        false
    }

    /// Drain conditioned audio for the logic side
    pub fn take_audio(&mut self) -> Vec<Sample> {
        self.out.lock().take_all()
    }

    pub fn stream_done(&self) -> bool {
        self.out.lock().stream_done()
    }

    pub fn clear(&mut self) {
        self.jitter_fifo.clear();
        self.out.lock().clear();
        self.stream_open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_passes_through_chain() {
        let mut bridge = NetBridge::new(0, 1000, 30000, 32000, 3000);
        bridge.write_net(&[100, -100], 0);
        bridge.tick(0);
        assert_eq!(bridge.take_audio(), vec![100, -100]);
    }

    #[test]
    fn test_preamp_and_clipping() {
        let mut bridge = NetBridge::new(0, 2000, 30000, 31000, 3000);
        bridge.write_net(&[20000], 0);
        bridge.tick(0);
        // 20000 × 2 saturates, then the limiter and clipper bound it
        let out = bridge.take_audio();
        assert_eq!(out.len(), 1);
        assert!(out[0] <= 31000);
    }

    #[test]
    fn test_jitter_prebuffer_holds_audio() {
        let mut bridge = NetBridge::new(160, 1000, 30000, 32000, 3000);
        bridge.write_net(&[1; 80], 0);
        bridge.tick(0);
        assert!(bridge.take_audio().is_empty());
        bridge.write_net(&[1; 80], 20);
        bridge.tick(20);
        assert_eq!(bridge.take_audio().len(), 160);
    }

    #[test]
    fn test_flush_timeout_forces_end() {
        let mut bridge = NetBridge::new(0, 1000, 30000, 32000, 3000);
        bridge.write_net(&[1; 160], 0);
        bridge.tick(0);
        assert!(bridge.is_active());
        assert!(!bridge.tick(2999));
        assert!(bridge.tick(3000));
        assert!(!bridge.is_active());
        bridge.take_audio();
        assert!(bridge.stream_done());
    }

    #[test]
    fn test_explicit_end_of_stream() {
        let mut bridge = NetBridge::new(0, 1000, 30000, 32000, 3000);
        bridge.write_net(&[5; 16], 0);
        bridge.end_of_stream();
        bridge.tick(0);
        assert_eq!(bridge.take_audio().len(), 16);
        assert!(bridge.stream_done());
    }
}
