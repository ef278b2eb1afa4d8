//! Summing mixer

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rg_core::{Sample, sample::apply_gain_permille};

use crate::graph::AudioSink;

struct InputBuf {
    buf: VecDeque<Sample>,
    gain_permille: i32,
    streaming: bool,
}

struct MixerInner {
    inputs: Vec<InputBuf>,
}

/// Sums its inputs with per-input gain. Inputs buffer independently; the
/// owner pulls mixed blocks with `mix()`. An input with no buffered samples
/// contributes silence, so a late stream never stalls the others.
pub struct Mixer {
    inner: Arc<Mutex<MixerInner>>,
}

impl Mixer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MixerInner { inputs: Vec::new() })),
        }
    }

    pub fn add_input(&self) -> MixerInput {
        let mut inner = self.inner.lock();
        inner.inputs.push(InputBuf {
            buf: VecDeque::new(),
            gain_permille: 1000,
            streaming: false,
        });
        MixerInput {
            inner: self.inner.clone(),
            idx: inner.inputs.len() - 1,
        }
    }

    pub fn set_input_gain(&self, input: &MixerInput, gain_permille: i32) {
        self.inner.lock().inputs[input.idx].gain_permille = gain_permille;
    }

    /// Mix up to `max` samples from all inputs
    pub fn mix(&self, max: usize) -> Vec<Sample> {
        let mut inner = self.inner.lock();
        let len = inner
            .inputs
            .iter()
            .map(|i| i.buf.len())
            .max()
            .unwrap_or(0)
            .min(max);
        if len == 0 {
            return Vec::new();
        }
        let mut out = vec![0i32; len];
        for input in inner.inputs.iter_mut() {
            let gain = input.gain_permille;
            for slot in out.iter_mut().take(len) {
                match input.buf.pop_front() {
                    Some(s) => *slot += apply_gain_permille(s, gain) as i32,
                    None => break,
                }
            }
        }
        out.into_iter()
            .map(|v| v.clamp(Sample::MIN as i32, Sample::MAX as i32) as Sample)
            .collect()
    }

    /// True while any input is inside a stream or has buffered samples
    pub fn is_active(&self) -> bool {
        self.inner
            .lock()
            .inputs
            .iter()
            .any(|i| i.streaming || !i.buf.is_empty())
    }

    pub fn samples_buffered(&self) -> usize {
        self.inner
            .lock()
            .inputs
            .iter()
            .map(|i| i.buf.len())
            .max()
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        for input in self.inner.lock().inputs.iter_mut() {
            input.buf.clear();
            input.streaming = false;
        }
    }
}

impl Default for Mixer {
    fn default() -> Self {
        Self::new()
    }
}

/// Write side of one mixer input
pub struct MixerInput {
    inner: Arc<Mutex<MixerInner>>,
    idx: usize,
}

impl AudioSink for MixerInput {
    fn write(&mut self, samples: &[Sample]) {
        let mut inner = self.inner.lock();
        let input = &mut inner.inputs[self.idx];
        input.streaming = true;
        input.buf.extend(samples.iter().copied());
    }

    fn flush(&mut self) {
        self.inner.lock().inputs[self.idx].streaming = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sums_inputs() {
        let mixer = Mixer::new();
        let mut a = mixer.add_input();
        let mut b = mixer.add_input();
        a.write(&[100, 100]);
        b.write(&[50, -50]);
        assert_eq!(mixer.mix(16), vec![150, 50]);
    }

    #[test]
    fn test_short_input_contributes_silence() {
        let mixer = Mixer::new();
        let mut a = mixer.add_input();
        let mut b = mixer.add_input();
        a.write(&[10, 10, 10]);
        b.write(&[1]);
        assert_eq!(mixer.mix(16), vec![11, 10, 10]);
    }

    #[test]
    fn test_input_gain_applied() {
        let mixer = Mixer::new();
        let mut a = mixer.add_input();
        mixer.set_input_gain(&a, 100);
        a.write(&[1000]);
        assert_eq!(mixer.mix(16), vec![100]);
    }

    #[test]
    fn test_sum_saturates() {
        let mixer = Mixer::new();
        let mut a = mixer.add_input();
        let mut b = mixer.add_input();
        a.write(&[30000]);
        b.write(&[30000]);
        assert_eq!(mixer.mix(16), vec![Sample::MAX]);
    }

    #[test]
    fn test_active_tracks_streams() {
        let mixer = Mixer::new();
        let mut a = mixer.add_input();
        assert!(!mixer.is_active());
        a.write(&[1]);
        assert!(mixer.is_active());
        mixer.mix(16);
        a.flush();
        assert!(!mixer.is_active());
    }
}
