//! GSM full-rate decoder seam
//!
//! The codec itself is an external collaborator; prompt playback only
//! needs one 33 byte frame decoded to 160 samples at a time.

use rg_core::Sample;

/// Bytes per GSM full-rate frame
pub const GSM_FRAME_BYTES: usize = 33;

/// Samples produced per GSM full-rate frame
pub const GSM_FRAME_SAMPLES: usize = 160;

/// Decodes one GSM full-rate frame into 160 samples
pub trait GsmDecoder: Send {
    fn decode_frame(&mut self, frame: &[u8; GSM_FRAME_BYTES]) -> [Sample; GSM_FRAME_SAMPLES];
}

/// Creates a fresh decoder per played file
pub trait GsmDecoderFactory: Send + Sync {
    fn new_decoder(&self) -> Box<dyn GsmDecoder>;
}
