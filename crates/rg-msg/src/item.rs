//! Message queue items
//!
//! Each item produces 16 bit mono samples at the internal rate until it
//! is exhausted. File formats are picked by extension: `.gsm` is GSM
//! full-rate, `.wav` is RIFF/WAVE mono 16 bit PCM at the internal rate,
//! anything else is raw 16 bit PCM.

use std::f32::consts::PI;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use rg_core::Sample;

use crate::error::{MsgError, MsgResult};
use crate::gsm::{GSM_FRAME_BYTES, GSM_FRAME_SAMPLES, GsmDecoder};

/// DTMF keypad: rows 697/770/852/941 Hz, columns 1209/1336/1477/1633 Hz
pub fn dtmf_tones(digit: char) -> Option<(f32, f32)> {
    const ROWS: [f32; 4] = [697.0, 770.0, 852.0, 941.0];
    const COLS: [f32; 4] = [1209.0, 1336.0, 1477.0, 1633.0];
    let (row, col) = match digit {
        '1' => (0, 0),
        '2' => (0, 1),
        '3' => (0, 2),
        'A' => (0, 3),
        '4' => (1, 0),
        '5' => (1, 1),
        '6' => (1, 2),
        'B' => (1, 3),
        '7' => (2, 0),
        '8' => (2, 1),
        '9' => (2, 2),
        'C' => (2, 3),
        '*' => (3, 0),
        '0' => (3, 1),
        '#' => (3, 2),
        'D' => (3, 3),
        _ => return None,
    };
    Some((ROWS[row], COLS[col]))
}

pub(crate) enum ItemSource {
    Raw {
        file: File,
    },
    Wav {
        file: File,
        data_remaining: u32,
    },
    Gsm {
        file: File,
        decoder: Box<dyn GsmDecoder>,
        frame: Vec<Sample>,
        frame_pos: usize,
    },
    Silence {
        remaining: usize,
    },
    Tone {
        fq: f32,
        amp_permille: i32,
        sample_rate: u32,
        pos: usize,
        total: usize,
    },
    Dtmf {
        fq1: f32,
        fq2: f32,
        amp_permille: i32,
        sample_rate: u32,
        pos: usize,
        total: usize,
    },
}

/// One staged playback item
pub struct QueueItem {
    pub(crate) source: ItemSource,
    pub idle_marked: bool,
}

impl QueueItem {
    /// Open a file item; the format is chosen by extension
    pub fn open_file(
        path: &Path,
        idle_marked: bool,
        sample_rate: u32,
        gsm_decoder: Option<Box<dyn GsmDecoder>>,
    ) -> MsgResult<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        let source = match ext.as_deref() {
            Some("wav") => open_wav(path, sample_rate)?,
            Some("gsm") => {
                let decoder = gsm_decoder.ok_or(MsgError::NoGsmDecoder)?;
                ItemSource::Gsm {
                    file: File::open(path)?,
                    decoder,
                    frame: Vec::new(),
                    frame_pos: 0,
                }
            }
            _ => ItemSource::Raw {
                file: File::open(path)?,
            },
        };
        Ok(Self {
            source,
            idle_marked,
        })
    }

    pub fn silence(length_ms: u64, idle_marked: bool, sample_rate: u32) -> Self {
        Self {
            source: ItemSource::Silence {
                remaining: rg_core::sample::ms_to_samples(length_ms, sample_rate),
            },
            idle_marked,
        }
    }

    pub fn tone(
        fq: f32,
        amp_permille: i32,
        length_ms: u64,
        idle_marked: bool,
        sample_rate: u32,
    ) -> Self {
        Self {
            source: ItemSource::Tone {
                fq,
                amp_permille,
                sample_rate,
                pos: 0,
                total: rg_core::sample::ms_to_samples(length_ms, sample_rate),
            },
            idle_marked,
        }
    }

    pub fn dtmf(
        digit: char,
        amp_permille: i32,
        length_ms: u64,
        idle_marked: bool,
        sample_rate: u32,
    ) -> MsgResult<Self> {
        let (fq1, fq2) = dtmf_tones(digit).ok_or(MsgError::BadDtmfDigit(digit))?;
        Ok(Self {
            source: ItemSource::Dtmf {
                fq1,
                fq2,
                amp_permille,
                sample_rate,
                pos: 0,
                total: rg_core::sample::ms_to_samples(length_ms, sample_rate),
            },
            idle_marked,
        })
    }

    /// Produce up to `out.len()` samples; 0 means the item is exhausted
    pub fn read(&mut self, out: &mut [Sample]) -> MsgResult<usize> {
        match &mut self.source {
            ItemSource::Raw { file } => read_pcm(file, out, u32::MAX),
            ItemSource::Wav {
                file,
                data_remaining,
            } => {
                let n = read_pcm(file, out, *data_remaining)?;
                *data_remaining -= (n * 2) as u32;
                Ok(n)
            }
            ItemSource::Gsm {
                file,
                decoder,
                frame,
                frame_pos,
            } => {
                let mut produced = 0;
                while produced < out.len() {
                    if *frame_pos >= frame.len() {
                        let mut raw = [0u8; GSM_FRAME_BYTES];
                        let cnt = read_full(file, &mut raw)?;
                        if cnt == 0 {
                            break;
                        }
                        if cnt != GSM_FRAME_BYTES {
                            log::warn!("*** WARNING: Corrupt GSM file: trailing partial frame");
                            break;
                        }
                        let decoded = decoder.decode_frame(&raw);
                        frame.clear();
                        frame.extend_from_slice(&decoded);
                        *frame_pos = 0;
                        debug_assert_eq!(frame.len(), GSM_FRAME_SAMPLES);
                    }
                    let n = (out.len() - produced).min(frame.len() - *frame_pos);
                    out[produced..produced + n]
                        .copy_from_slice(&frame[*frame_pos..*frame_pos + n]);
                    *frame_pos += n;
                    produced += n;
                }
                Ok(produced)
            }
            ItemSource::Silence { remaining } => {
                let n = out.len().min(*remaining);
                out[..n].fill(0);
                *remaining -= n;
                Ok(n)
            }
            ItemSource::Tone {
                fq,
                amp_permille,
                sample_rate,
                pos,
                total,
            } => {
                let n = out.len().min(*total - *pos);
                for (i, slot) in out.iter_mut().enumerate().take(n) {
                    let t = (*pos + i) as f32 / *sample_rate as f32;
                    let v = *amp_permille as f32 / 1000.0 * (2.0 * PI * *fq * t).sin();
                    *slot = (v * Sample::MAX as f32) as Sample;
                }
                *pos += n;
                Ok(n)
            }
            ItemSource::Dtmf {
                fq1,
                fq2,
                amp_permille,
                sample_rate,
                pos,
                total,
            } => {
                let n = out.len().min(*total - *pos);
                for (i, slot) in out.iter_mut().enumerate().take(n) {
                    let t = (*pos + i) as f32 / *sample_rate as f32;
                    let amp = *amp_permille as f32 / 1000.0 * Sample::MAX as f32;
                    let v = amp * (2.0 * PI * *fq1 * t).sin() + amp * (2.0 * PI * *fq2 * t).sin();
                    *slot = (v as i32).clamp(Sample::MIN as i32, Sample::MAX as i32) as Sample;
                }
                *pos += n;
                Ok(n)
            }
        }
    }
}

fn read_full(file: &mut File, buf: &mut [u8]) -> MsgResult<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

fn read_pcm(file: &mut File, out: &mut [Sample], limit_bytes: u32) -> MsgResult<usize> {
    let want_bytes = (out.len() * 2).min(limit_bytes as usize);
    let mut raw = vec![0u8; want_bytes];
    let got = read_full(file, &mut raw)?;
    let samples = got / 2;
    for (i, slot) in out.iter_mut().enumerate().take(samples) {
        *slot = Sample::from_le_bytes([raw[i * 2], raw[i * 2 + 1]]);
    }
    Ok(samples)
}

/// Walk the RIFF chunk list, accepting sub-chunks in any order, and leave
/// the file positioned at the start of the audio data.
fn open_wav(path: &Path, sample_rate: u32) -> MsgResult<ItemSource> {
    let mut file = File::open(path)?;

    let mut riff = [0u8; 12];
    if read_full(&mut file, &mut riff)? != 12 || &riff[0..4] != b"RIFF" || &riff[8..12] != b"WAVE"
    {
        return Err(MsgError::BadWav(format!(
            "{}: not a RIFF/WAVE file",
            path.display()
        )));
    }

    let mut fmt: Option<(u16, u16, u32, u16)> = None;
    let mut data: Option<(u64, u32)> = None;
    loop {
        let mut hdr = [0u8; 8];
        let got = read_full(&mut file, &mut hdr)?;
        if got == 0 {
            break;
        }
        if got != 8 {
            return Err(MsgError::BadWav(format!(
                "{}: truncated chunk header",
                path.display()
            )));
        }
        let id = [hdr[0], hdr[1], hdr[2], hdr[3]];
        let size = u32::from_le_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);
        match &id {
            b"fmt " => {
                let mut body = vec![0u8; size as usize];
                if read_full(&mut file, &mut body)? != size as usize || size < 16 {
                    return Err(MsgError::BadWav(format!(
                        "{}: truncated fmt chunk",
                        path.display()
                    )));
                }
                fmt = Some((
                    u16::from_le_bytes([body[0], body[1]]),
                    u16::from_le_bytes([body[2], body[3]]),
                    u32::from_le_bytes([body[4], body[5], body[6], body[7]]),
                    u16::from_le_bytes([body[14], body[15]]),
                ));
            }
            b"data" => {
                let pos = file.stream_position()?;
                data = Some((pos, size));
                file.seek(SeekFrom::Current(size as i64))?;
            }
            _ => {
                // Unknown sub-chunk, skip (chunks are word aligned)
                file.seek(SeekFrom::Current(size as i64 + (size & 1) as i64))?;
            }
        }
        if fmt.is_some() && data.is_some() {
            break;
        }
    }

    let (audio_format, channels, rate, bits) = fmt.ok_or_else(|| {
        MsgError::BadWav(format!("{}: no fmt chunk", path.display()))
    })?;
    let (data_pos, data_size) = data.ok_or_else(|| {
        MsgError::BadWav(format!("{}: no data chunk", path.display()))
    })?;

    if audio_format != 1 {
        return Err(MsgError::BadWav(format!(
            "{}: not PCM (format {audio_format})",
            path.display()
        )));
    }
    if channels != 1 {
        return Err(MsgError::BadWav(format!(
            "{}: {channels} channels, only mono is supported",
            path.display()
        )));
    }
    if bits != 16 {
        return Err(MsgError::BadWav(format!(
            "{}: {bits} bits per sample, only 16 is supported",
            path.display()
        )));
    }
    if rate != sample_rate {
        return Err(MsgError::BadWav(format!(
            "{}: sample rate {rate} does not match internal rate {sample_rate}",
            path.display()
        )));
    }

    file.seek(SeekFrom::Start(data_pos))?;
    Ok(ItemSource::Wav {
        file,
        data_remaining: data_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtmf_table() {
        assert_eq!(dtmf_tones('1'), Some((697.0, 1209.0)));
        assert_eq!(dtmf_tones('#'), Some((941.0, 1477.0)));
        assert_eq!(dtmf_tones('D'), Some((941.0, 1633.0)));
        assert_eq!(dtmf_tones('x'), None);
    }

    #[test]
    fn test_silence_item_length() {
        let mut item = QueueItem::silence(10, false, 16000);
        let mut out = [1i16; 200];
        assert_eq!(item.read(&mut out).unwrap(), 160);
        assert!(out[..160].iter().all(|&s| s == 0));
        assert_eq!(item.read(&mut out).unwrap(), 0);
    }

    #[test]
    fn test_tone_item_amplitude() {
        let mut item = QueueItem::tone(1000.0, 500, 100, false, 16000);
        let mut out = [0i16; 1600];
        assert_eq!(item.read(&mut out).unwrap(), 1600);
        let peak = out.iter().map(|s| s.unsigned_abs()).max().unwrap();
        // Half amplitude tone peaks near 16383
        assert!(peak > 15000 && peak < 16500, "peak={peak}");
    }

    #[test]
    fn test_dtmf_item_contains_both_tones() {
        let mut item = QueueItem::dtmf('5', 300, 50, false, 16000).unwrap();
        let mut out = [0i16; 800];
        assert_eq!(item.read(&mut out).unwrap(), 800);
        assert!(out.iter().any(|&s| s != 0));
    }

    #[test]
    fn test_bad_dtmf_digit_rejected() {
        assert!(QueueItem::dtmf('Q', 300, 50, false, 16000).is_err());
    }
}
