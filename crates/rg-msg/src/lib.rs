//! rg-msg: prompt playback serialisation
//!
//! The message handler stages playback items (audio files, silence, tones,
//! DTMF) and produces them in order onto the owning logic's TX path. Items
//! marked idle (background beeps) do not count against `is_idle()`; the
//! handler is idle exactly when no non-idle item is pending. `begin()` /
//! `end()` batches keep multi-item sequences from starting to play until
//! the whole batch is staged.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use rg_core::Sample;

mod error;
pub mod gsm;
pub mod item;

pub use error::{MsgError, MsgResult};
pub use gsm::{GsmDecoder, GsmDecoderFactory};
pub use item::QueueItem;

/// Events the owner drains after pumping the handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgEvent {
    /// The queue has just become empty
    AllMsgsWritten,
}

/// Serialises prompt playback into a sample stream
pub struct MessageHandler {
    sample_rate: u32,
    queue: VecDeque<QueueItem>,
    nesting_level: u32,
    pending_play_next: bool,
    playing: bool,
    non_idle_cnt: i64,
    events: VecDeque<MsgEvent>,
    gsm_factory: Option<Arc<dyn GsmDecoderFactory>>,
}

impl MessageHandler {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            queue: VecDeque::new(),
            nesting_level: 0,
            pending_play_next: false,
            playing: false,
            non_idle_cnt: 0,
            events: VecDeque::new(),
            gsm_factory: None,
        }
    }

    /// Register the external GSM codec; without one `.gsm` prompts are
    /// rejected with a warning.
    pub fn set_gsm_decoder_factory(&mut self, factory: Arc<dyn GsmDecoderFactory>) {
        self.gsm_factory = Some(factory);
    }

    pub fn play_file(&mut self, path: &Path, idle_marked: bool) {
        let decoder = self.gsm_factory.as_ref().map(|f| f.new_decoder());
        match QueueItem::open_file(path, idle_marked, self.sample_rate, decoder) {
            Ok(item) => self.enqueue(item),
            Err(e) => log::warn!("*** WARNING: Could not play {}: {e}", path.display()),
        }
    }

    pub fn play_silence(&mut self, length_ms: u64, idle_marked: bool) {
        let item = QueueItem::silence(length_ms, idle_marked, self.sample_rate);
        self.enqueue(item);
    }

    pub fn play_tone(&mut self, fq: f32, amp_permille: i32, length_ms: u64, idle_marked: bool) {
        let item = QueueItem::tone(fq, amp_permille, length_ms, idle_marked, self.sample_rate);
        self.enqueue(item);
    }

    pub fn play_dtmf(&mut self, digit: char, amp_permille: i32, length_ms: u64, idle_marked: bool) {
        match QueueItem::dtmf(digit, amp_permille, length_ms, idle_marked, self.sample_rate) {
            Ok(item) => self.enqueue(item),
            Err(e) => log::warn!("*** WARNING: {e}"),
        }
    }

    /// Open a staging batch; batches nest and playback starts when the
    /// outermost batch closes.
    pub fn begin(&mut self) {
        if self.nesting_level == 0 {
            self.pending_play_next = false;
        }
        self.nesting_level += 1;
    }

    pub fn end(&mut self) {
        debug_assert!(self.nesting_level > 0);
        if self.nesting_level == 0 {
            return;
        }
        self.nesting_level -= 1;
        if self.nesting_level == 0 {
            if self.pending_play_next {
                self.pending_play_next = false;
                self.playing = true;
            } else if self.queue.is_empty() {
                self.events.push_back(MsgEvent::AllMsgsWritten);
            }
        }
    }

    /// Abort everything, staged and playing
    pub fn clear(&mut self) {
        self.queue.clear();
        self.non_idle_cnt = 0;
        self.playing = false;
        self.pending_play_next = false;
    }

    /// True iff no non-idle item is pending
    pub fn is_idle(&self) -> bool {
        self.non_idle_cnt == 0
    }

    /// True iff any item is pending
    pub fn is_writing_message(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn take_events(&mut self) -> Vec<MsgEvent> {
        self.events.drain(..).collect()
    }

    /// Produce up to `out.len()` samples from the queue front
    pub fn read(&mut self, out: &mut [Sample]) -> usize {
        if !self.playing {
            return 0;
        }
        let mut produced = 0;
        while produced < out.len() {
            let Some(item) = self.queue.front_mut() else {
                break;
            };
            match item.read(&mut out[produced..]) {
                Ok(0) => self.pop_front_item(),
                Ok(n) => produced += n,
                Err(e) => {
                    log::warn!("*** WARNING: Message playback failed: {e}");
                    self.pop_front_item();
                }
            }
        }
        if self.queue.is_empty() {
            self.playing = false;
        }
        produced
    }

    fn enqueue(&mut self, item: QueueItem) {
        if !item.idle_marked {
            self.non_idle_cnt += 1;
        }
        self.queue.push_back(item);
        if self.queue.len() == 1 {
            if self.nesting_level == 0 {
                self.playing = true;
            } else {
                self.pending_play_next = true;
            }
        }
    }

    fn pop_front_item(&mut self) {
        if let Some(item) = self.queue.pop_front() {
            if !item.idle_marked {
                self.non_idle_cnt -= 1;
                debug_assert!(self.non_idle_cnt >= 0);
            }
            if self.queue.is_empty() {
                self.events.push_back(MsgEvent::AllMsgsWritten);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_accounting() {
        let mut mh = MessageHandler::new(16000);
        assert!(mh.is_idle());
        mh.play_silence(10, false);
        assert!(!mh.is_idle());
        assert!(mh.is_writing_message());
        mh.play_tone(440.0, 300, 10, true);

        let mut out = [0i16; 4000];
        while mh.read(&mut out) > 0 {}
        assert!(mh.is_idle());
        assert!(!mh.is_writing_message());
        assert_eq!(mh.take_events(), vec![MsgEvent::AllMsgsWritten]);
    }

    #[test]
    fn test_idle_marked_does_not_block_idle() {
        let mut mh = MessageHandler::new(16000);
        mh.play_silence(10, true);
        assert!(mh.is_idle());
        assert!(mh.is_writing_message());
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut mh = MessageHandler::new(16000);
        mh.play_silence(1000, false);
        mh.play_tone(440.0, 300, 1000, false);
        mh.clear();
        assert!(mh.is_idle());
        assert!(!mh.is_writing_message());
        let mut out = [0i16; 16];
        assert_eq!(mh.read(&mut out), 0);
    }

    #[test]
    fn test_batch_defers_playback() {
        let mut mh = MessageHandler::new(16000);
        mh.begin();
        mh.play_silence(10, false);
        let mut out = [0i16; 16];
        assert_eq!(mh.read(&mut out), 0);
        mh.end();
        assert!(mh.read(&mut out) > 0);
    }

    #[test]
    fn test_nested_batches_fire_once_on_outermost_close() {
        let mut mh = MessageHandler::new(16000);
        mh.begin();
        mh.begin();
        mh.play_silence(10, false);
        mh.end();
        let mut out = [0i16; 16];
        assert_eq!(mh.read(&mut out), 0);
        mh.end();
        assert!(mh.read(&mut out) > 0);
    }

    #[test]
    fn test_empty_batch_reports_all_written() {
        let mut mh = MessageHandler::new(16000);
        mh.begin();
        mh.end();
        assert_eq!(mh.take_events(), vec![MsgEvent::AllMsgsWritten]);
    }

    #[test]
    fn test_wav_loader_rejects_stereo() {
        use std::io::Write as _;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        {
            let spec = hound::WavSpec {
                channels: 2,
                sample_rate: 16000,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            };
            let mut w = hound::WavWriter::create(&path, spec).unwrap();
            for _ in 0..32 {
                w.write_sample(0i16).unwrap();
            }
            w.finalize().unwrap();
        }
        // Extra unknown chunk before fmt must also be tolerated on valid files
        let good = dir.path().join("mono.wav");
        {
            let spec = hound::WavSpec {
                channels: 1,
                sample_rate: 16000,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            };
            let mut w = hound::WavWriter::create(&good, spec).unwrap();
            for i in 0..16 {
                w.write_sample(i as i16).unwrap();
            }
            w.finalize().unwrap();
        }
        let raw = dir.path().join("x.raw");
        let mut f = std::fs::File::create(&raw).unwrap();
        f.write_all(&[1, 0, 2, 0]).unwrap();
        drop(f);

        let wrong_rate = dir.path().join("slow.wav");
        {
            let spec = hound::WavSpec {
                channels: 1,
                sample_rate: 8000,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            };
            let mut w = hound::WavWriter::create(&wrong_rate, spec).unwrap();
            for _ in 0..16 {
                w.write_sample(0i16).unwrap();
            }
            w.finalize().unwrap();
        }

        let mut mh = MessageHandler::new(16000);
        mh.play_file(&path, false); // rejected with a warning
        assert!(!mh.is_writing_message());
        mh.play_file(&wrong_rate, false); // rejected too
        assert!(!mh.is_writing_message());

        mh.play_file(&good, false);
        assert!(mh.is_writing_message());
        let mut out = [0i16; 64];
        let n = mh.read(&mut out);
        assert_eq!(n, 16);
        assert_eq!(&out[..4], &[0, 1, 2, 3]);

        mh.play_file(&raw, false);
        let n = mh.read(&mut out);
        assert_eq!(n, 2);
        assert_eq!(&out[..2], &[1, 2]);
    }

    #[test]
    fn test_gsm_without_decoder_rejected() {
        use std::io::Write as _;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompt.gsm");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&[0u8; 33])
            .unwrap();
        let mut mh = MessageHandler::new(16000);
        mh.play_file(&path, false);
        assert!(!mh.is_writing_message());
    }

    #[test]
    fn test_gsm_decoding() {
        use std::io::Write as _;
        struct StubDecoder;
        impl GsmDecoder for StubDecoder {
            fn decode_frame(&mut self, _frame: &[u8; 33]) -> [Sample; 160] {
                [7; 160]
            }
        }
        struct StubFactory;
        impl GsmDecoderFactory for StubFactory {
            fn new_decoder(&self) -> Box<dyn GsmDecoder> {
                Box::new(StubDecoder)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompt.gsm");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&[0u8; 66])
            .unwrap();

        let mut mh = MessageHandler::new(16000);
        mh.set_gsm_decoder_factory(Arc::new(StubFactory));
        mh.play_file(&path, false);
        let mut out = [0i16; 400];
        assert_eq!(mh.read(&mut out), 320);
        assert!(out[..320].iter().all(|&s| s == 7));
    }
}
