//! WAV recorder sink

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use rg_core::Sample;

use crate::error::{AudioError, AudioResult};
use crate::graph::AudioSink;

/// Streams received audio into a mono 16 bit PCM WAV file
pub struct WavRecorderSink {
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    path: Option<PathBuf>,
    sample_rate: u32,
    samples_written: u64,
}

impl WavRecorderSink {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            writer: None,
            path: None,
            sample_rate,
            samples_written: 0,
        }
    }

    pub fn open(&mut self, path: &Path) -> AudioResult<()> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.writer = Some(hound::WavWriter::create(path, spec)?);
        self.path = Some(path.to_path_buf());
        self.samples_written = 0;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Finalize the WAV header and close the file, returning its path
    pub fn close(&mut self) -> AudioResult<PathBuf> {
        let writer = self.writer.take().ok_or(AudioError::RecorderNotOpen)?;
        writer.finalize()?;
        self.path.take().ok_or(AudioError::RecorderNotOpen)
    }
}

impl AudioSink for WavRecorderSink {
    fn write(&mut self, samples: &[Sample]) {
        if let Some(writer) = self.writer.as_mut() {
            for &s in samples {
                if let Err(e) = writer.write_sample(s) {
                    log::error!("*** ERROR: QSO recorder write failed: {e}");
                    return;
                }
            }
            self.samples_written += samples.len() as u64;
        }
    }

    fn flush(&mut self) {
        if let Some(writer) = self.writer.as_mut()
            && let Err(e) = writer.flush()
        {
            log::warn!("*** WARNING: QSO recorder flush failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_records_and_finalizes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rec.wav");
        let mut rec = WavRecorderSink::new(16000);
        rec.open(&path).unwrap();
        rec.write(&[0, 1, -1, 100]);
        assert_eq!(rec.samples_written(), 4);
        let closed = rec.close().unwrap();
        assert_eq!(closed, path);

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.spec().sample_rate, 16000);
        assert_eq!(reader.len(), 4);
    }

    #[test]
    fn test_close_without_open_errors() {
        let mut rec = WavRecorderSink::new(16000);
        assert!(rec.close().is_err());
    }
}
