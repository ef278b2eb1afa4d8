//! Gain, clipping and limiting sinks

use rg_core::{Sample, sample::apply_gain_permille};

use crate::graph::AudioSink;

/// Per-mille gain stage (1000 = unity)
pub struct AmplifierSink {
    gain_permille: i32,
    out: Option<Box<dyn AudioSink>>,
    scratch: Vec<Sample>,
}

impl AmplifierSink {
    pub fn new(gain_permille: i32) -> Self {
        Self {
            gain_permille,
            out: None,
            scratch: Vec::new(),
        }
    }

    pub fn set_output(&mut self, out: Box<dyn AudioSink>) {
        self.out = Some(out);
    }

    pub fn set_gain(&mut self, gain_permille: i32) {
        self.gain_permille = gain_permille;
    }

    pub fn gain(&self) -> i32 {
        self.gain_permille
    }
}

impl AudioSink for AmplifierSink {
    fn write(&mut self, samples: &[Sample]) {
        if let Some(out) = self.out.as_mut() {
            let gain = self.gain_permille;
            self.scratch.clear();
            self.scratch
                .extend(samples.iter().map(|&s| apply_gain_permille(s, gain)));
            out.write(&self.scratch);
        }
    }

    fn flush(&mut self) {
        if let Some(out) = self.out.as_mut() {
            out.flush();
        }
    }
}

/// Hard clipper at the configured absolute level
pub struct ClipperSink {
    limit: Sample,
    out: Option<Box<dyn AudioSink>>,
    scratch: Vec<Sample>,
}

impl ClipperSink {
    pub fn new(limit: Sample) -> Self {
        Self {
            limit,
            out: None,
            scratch: Vec::new(),
        }
    }

    pub fn set_output(&mut self, out: Box<dyn AudioSink>) {
        self.out = Some(out);
    }
}

impl AudioSink for ClipperSink {
    fn write(&mut self, samples: &[Sample]) {
        if let Some(out) = self.out.as_mut() {
            let limit = self.limit;
            self.scratch.clear();
            self.scratch
                .extend(samples.iter().map(|&s| s.clamp(-limit, limit)));
            out.write(&self.scratch);
        }
    }

    fn flush(&mut self) {
        if let Some(out) = self.out.as_mut() {
            out.flush();
        }
    }
}

/// Soft limiter: the excess above the threshold is compressed 4:1 so
/// splatter stays audible instead of folding into hard clipping.
pub struct LimiterSink {
    threshold: Sample,
    out: Option<Box<dyn AudioSink>>,
    scratch: Vec<Sample>,
}

impl LimiterSink {
    pub fn new(threshold: Sample) -> Self {
        Self {
            threshold,
            out: None,
            scratch: Vec::new(),
        }
    }

    pub fn set_output(&mut self, out: Box<dyn AudioSink>) {
        self.out = Some(out);
    }

    fn limit(thresh: i32, s: Sample) -> Sample {
        let v = s as i32;
        let limited = if v > thresh {
            thresh + (v - thresh) / 4
        } else if v < -thresh {
            -thresh + (v + thresh) / 4
        } else {
            v
        };
        limited.clamp(Sample::MIN as i32, Sample::MAX as i32) as Sample
    }
}

impl AudioSink for LimiterSink {
    fn write(&mut self, samples: &[Sample]) {
        if let Some(out) = self.out.as_mut() {
            let thresh = self.threshold as i32;
            self.scratch.clear();
            self.scratch
                .extend(samples.iter().map(|&s| Self::limit(thresh, s)));
            out.write(&self.scratch);
        }
    }

    fn flush(&mut self) {
        if let Some(out) = self.out.as_mut() {
            out.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Collector, shared};

    #[test]
    fn test_amplifier_scales() {
        let sink = shared(Collector::new());
        let mut amp = AmplifierSink::new(500);
        amp.set_output(Box::new(sink.clone()));
        amp.write(&[1000, -1000]);
        assert_eq!(sink.lock().take_all(), vec![500, -500]);
    }

    #[test]
    fn test_clipper_clamps() {
        let sink = shared(Collector::new());
        let mut clip = ClipperSink::new(100);
        clip.set_output(Box::new(sink.clone()));
        clip.write(&[50, 200, -300]);
        assert_eq!(sink.lock().take_all(), vec![50, 100, -100]);
    }

    #[test]
    fn test_limiter_compresses_excess() {
        let sink = shared(Collector::new());
        let mut lim = LimiterSink::new(1000);
        lim.set_output(Box::new(sink.clone()));
        lim.write(&[500, 2000, -2000]);
        assert_eq!(sink.lock().take_all(), vec![500, 1250, -1250]);
    }
}
