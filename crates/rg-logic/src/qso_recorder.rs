//! QSO recorder
//!
//! Records radio traffic into rolling WAV chunks. A chunk is closed at the
//! hard time limit, or at the first idle moment once the soft limit has
//! passed. Chunks shorter than the minimum are deleted instead of kept.
//! Finalised chunks are renamed from the dotfile working name to
//! `qsorec_<logic>_<begin>_<end>.wav` and the recording directory is
//! trimmed to its size budget, newest files first. An optional external
//! encoder command is spawned on every kept chunk.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};

use chrono::{DateTime, Local};
use rg_audio::{AudioSink, Collector, Selector, SelectorPort, WavRecorderSink, shared};
use rg_core::{Config, CoreError, CoreResult, Sample};

const ENCODER_TIMEOUT_MS: u64 = 3_600_000;
const TIMESTAMP_FMT: &str = "%Y-%m-%d_%H%M%S";

pub struct QsoRecorder {
    logic_name: String,
    rec_dir: PathBuf,
    hard_chunk_ms: u64,
    soft_chunk_ms: u64,
    min_samples: u64,
    max_dir_bytes: u64,
    encoder_cmd: Option<String>,
    sample_rate: u32,
    enabled: bool,

    selector: Selector,
    sink: std::sync::Arc<parking_lot::Mutex<Collector>>,
    recorder: WavRecorderSink,
    chunk_opened_at: Option<u64>,
    chunk_begin: Option<DateTime<Local>>,
    last_audio_ms: u64,
    encoders: Vec<(Child, u64)>,
}

impl QsoRecorder {
    /// Build from a config section: `REC_DIR` (required), `MAX_TIME`,
    /// `SOFT_TIME`, `MIN_TIME` (seconds), `MAX_DIRSIZE` (megabytes),
    /// `DEFAULT_ACTIVE`, `ENCODER_CMD`.
    pub fn from_config(
        cfg: &Config,
        section: &str,
        logic_name: &str,
        sample_rate: u32,
    ) -> CoreResult<Self> {
        let rec_dir: String = cfg.get_required(section, "REC_DIR")?;
        let max_time: u64 = cfg.get_or(section, "MAX_TIME", 0)?;
        let soft_time: u64 = cfg.get_or(section, "SOFT_TIME", 0)?;
        let min_time: u64 = cfg.get_or(section, "MIN_TIME", 0)?;
        let max_dirsize_mb: u64 = cfg.get_or(section, "MAX_DIRSIZE", 0)?;
        let default_active: u8 = cfg.get_or(section, "DEFAULT_ACTIVE", 0)?;
        let encoder_cmd = cfg.value(section, "ENCODER_CMD").map(str::to_string);

        if soft_time > max_time {
            return Err(CoreError::Config(format!(
                "{section}/SOFT_TIME must not exceed MAX_TIME"
            )));
        }

        let selector = Selector::new();
        let sink = shared(Collector::new());
        selector.set_output(Box::new(sink.clone()));

        Ok(Self {
            logic_name: logic_name.to_string(),
            rec_dir: PathBuf::from(rec_dir),
            hard_chunk_ms: max_time * 1000,
            soft_chunk_ms: soft_time * 1000,
            min_samples: min_time * sample_rate as u64,
            max_dir_bytes: max_dirsize_mb * 1024 * 1024,
            encoder_cmd,
            sample_rate,
            enabled: default_active != 0,
            selector,
            sink,
            recorder: WavRecorderSink::new(sample_rate),
            chunk_opened_at: None,
            chunk_begin: None,
            last_audio_ms: 0,
            encoders: Vec::new(),
        })
    }

    /// Register an audio source on the recorder's priority selector
    pub fn add_source(&self, prio: i32) -> SelectorPort {
        self.selector.add_source(prio, true)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enable: bool, now_ms: u64) {
        if self.enabled == enable {
            return;
        }
        self.enabled = enable;
        log::info!(
            "{}: QSO recorder {}",
            self.logic_name,
            if enable { "enabled" } else { "disabled" }
        );
        if !enable {
            self.close_chunk(now_ms);
            self.sink.lock().clear();
        }
    }

    fn working_path(&self) -> PathBuf {
        self.rec_dir
            .join(format!(".qsorec_{}.wav", self.logic_name))
    }

    fn open_chunk(&mut self, now_ms: u64) {
        let path = self.working_path();
        if let Err(e) = self.recorder.open(&path) {
            log::error!("*** ERROR: Could not open QSO recording {}: {e}", path.display());
            return;
        }
        self.chunk_opened_at = Some(now_ms);
        self.chunk_begin = Some(Local::now());
    }

    fn close_chunk(&mut self, now_ms: u64) {
        if !self.recorder.is_open() {
            return;
        }
        let samples = self.recorder.samples_written();
        let path = match self.recorder.close() {
            Ok(p) => p,
            Err(e) => {
                log::error!("*** ERROR: Could not close QSO recording: {e}");
                return;
            }
        };
        self.chunk_opened_at = None;

        if samples < self.min_samples {
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("*** WARNING: Could not delete short QSO chunk: {e}");
            }
            self.chunk_begin = None;
            return;
        }

        let begin = self.chunk_begin.take().unwrap_or_else(Local::now);
        let end = Local::now();
        let basename = format!(
            "qsorec_{}_{}_{}",
            self.logic_name,
            begin.format(TIMESTAMP_FMT),
            end.format(TIMESTAMP_FMT)
        );
        let mut final_path = self.rec_dir.join(format!("{basename}.wav"));
        let mut serial = 0;
        while final_path.exists() {
            serial += 1;
            final_path = self.rec_dir.join(format!("{basename}_{serial}.wav"));
        }
        if let Err(e) = std::fs::rename(&path, &final_path) {
            log::error!("*** ERROR: QSO recorder rename failed: {e}");
            return;
        }

        self.spawn_encoder(&final_path, &basename, now_ms);
        self.evict_old_recordings();
    }

    fn spawn_encoder(&mut self, final_path: &std::path::Path, basename: &str, now_ms: u64) {
        let Some(cmd) = self.encoder_cmd.as_ref() else {
            return;
        };
        let cmdline = cmd
            .replace("%f", &final_path.display().to_string())
            .replace("%d", &self.rec_dir.display().to_string())
            .replace("%b", basename)
            .replace("%n", &self.logic_name);
        match Command::new("nice")
            .args(["sh", "-c", &cmdline])
            .stdin(Stdio::null())
            .spawn()
        {
            Ok(child) => self.encoders.push((child, now_ms)),
            Err(e) => log::error!("*** ERROR: Could not spawn QSO encoder: {e}"),
        }
    }

    fn evict_old_recordings(&self) {
        if self.max_dir_bytes == 0 {
            return;
        }
        let mut files: Vec<(std::time::SystemTime, u64, PathBuf)> = Vec::new();
        for entry in walkdir::WalkDir::new(&self.rec_dir)
            .max_depth(1)
            .into_iter()
            .flatten()
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("qsorec_") {
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                let mtime = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
                files.push((mtime, meta.len(), entry.into_path()));
            }
        }
        // Newest first; delete once the cumulative size passes the budget
        files.sort_by(|a, b| b.0.cmp(&a.0));
        let mut total = 0u64;
        for (_, size, path) in files {
            total += size;
            if total > self.max_dir_bytes {
                if let Err(e) = std::fs::remove_file(&path) {
                    log::warn!("*** WARNING: QSO recorder eviction failed: {e}");
                }
            }
        }
    }

    /// Drain buffered audio into the current chunk and run the roll and
    /// encoder supervision timers.
    pub fn tick(&mut self, now_ms: u64) {
        let samples: Vec<Sample> = self.sink.lock().take_all();
        if self.enabled && !samples.is_empty() {
            if !self.recorder.is_open() {
                self.open_chunk(now_ms);
            }
            self.recorder.write(&samples);
            self.last_audio_ms = now_ms;
        }

        if let Some(opened) = self.chunk_opened_at {
            let age = now_ms.saturating_sub(opened);
            let idle = self.selector.selected().is_none() && samples.is_empty();
            let hard_hit = self.hard_chunk_ms > 0 && age >= self.hard_chunk_ms;
            let soft_hit = self.soft_chunk_ms > 0 && age >= self.soft_chunk_ms && idle;
            if hard_hit || soft_hit {
                self.close_chunk(now_ms);
            }
        }

        // Reap finished encoders; kill runaways
        self.encoders.retain_mut(|(child, spawned)| {
            match child.try_wait() {
                Ok(Some(_)) => false,
                Ok(None) => {
                    if now_ms.saturating_sub(*spawned) > ENCODER_TIMEOUT_MS {
                        log::warn!("*** WARNING: QSO encoder timed out, killing");
                        let _ = child.kill();
                        false
                    } else {
                        true
                    }
                }
                Err(_) => false,
            }
        });
    }

    /// Close any open chunk, e.g. at logic teardown
    pub fn finalize(&mut self, now_ms: u64) {
        self.close_chunk(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn recorder(dir: &std::path::Path, max: u64, soft: u64, min: u64) -> QsoRecorder {
        let mut cfg = Config::new();
        cfg.load_str(&format!(
            "[QsoRecorder]\n\
             REC_DIR={}\n\
             MAX_TIME={max}\n\
             SOFT_TIME={soft}\n\
             MIN_TIME={min}\n\
             DEFAULT_ACTIVE=1\n",
            dir.display()
        ))
        .unwrap();
        QsoRecorder::from_config(&cfg, "QsoRecorder", "TestLogic", 16000).unwrap()
    }

    fn kept_chunks(dir: &std::path::Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with("qsorec_"))
            .collect()
    }

    #[test]
    fn test_short_chunk_deleted() {
        let dir = tempdir().unwrap();
        let mut rec = recorder(dir.path(), 300, 0, 5);
        let mut port = rec.add_source(0);

        port.write(&[1; 1600]); // 0.1 s, below the 5 s minimum
        port.flush();
        rec.tick(0);
        rec.finalize(100);

        assert!(kept_chunks(dir.path()).is_empty());
        assert!(!dir.path().join(".qsorec_TestLogic.wav").exists());
    }

    #[test]
    fn test_long_chunk_kept_and_renamed() {
        let dir = tempdir().unwrap();
        let mut rec = recorder(dir.path(), 300, 0, 1);
        let mut port = rec.add_source(0);

        port.write(&vec![1; 32000]); // 2 s
        port.flush();
        rec.tick(0);
        rec.finalize(2000);

        let chunks = kept_chunks(dir.path());
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].starts_with("qsorec_TestLogic_"));
        assert!(chunks[0].ends_with(".wav"));
    }

    #[test]
    fn test_hard_limit_rolls() {
        let dir = tempdir().unwrap();
        let mut rec = recorder(dir.path(), 10, 0, 1);
        let mut port = rec.add_source(0);

        port.write(&vec![1; 32000]);
        rec.tick(0);
        port.write(&vec![1; 32000]);
        rec.tick(10_000); // hard limit reached, still streaming
        assert_eq!(kept_chunks(dir.path()).len(), 1);

        port.write(&vec![1; 32000]);
        rec.tick(10_500); // second chunk opens on the next audio
        port.flush();
        rec.finalize(20_000);
        assert_eq!(kept_chunks(dir.path()).len(), 2);
    }

    #[test]
    fn test_soft_limit_waits_for_idle() {
        let dir = tempdir().unwrap();
        let mut rec = recorder(dir.path(), 300, 30, 1);
        let mut port = rec.add_source(0);

        port.write(&vec![1; 32000]);
        rec.tick(0);
        port.write(&vec![1; 32000]);
        rec.tick(35_000); // past soft limit but still streaming: no roll
        assert!(kept_chunks(dir.path()).is_empty());

        port.flush();
        rec.tick(40_000); // drains the tail
        rec.tick(40_100); // idle past soft limit: roll
        assert_eq!(kept_chunks(dir.path()).len(), 1);
    }

    #[test]
    fn test_disable_closes_chunk() {
        let dir = tempdir().unwrap();
        let mut rec = recorder(dir.path(), 300, 0, 1);
        let mut port = rec.add_source(0);
        port.write(&vec![1; 32000]);
        rec.tick(0);
        rec.set_enabled(false, 1000);
        assert_eq!(kept_chunks(dir.path()).len(), 1);

        // Audio while disabled is discarded
        port.write(&vec![1; 32000]);
        rec.tick(2000);
        assert!(!dir.path().join(".qsorec_TestLogic.wav").exists());
    }

    #[test]
    fn test_directory_eviction() {
        let dir = tempdir().unwrap();
        // 1 MB budget
        let mut cfg = Config::new();
        cfg.load_str(&format!(
            "[QsoRecorder]\n\
             REC_DIR={}\n\
             MAX_TIME=300\nMIN_TIME=0\nMAX_DIRSIZE=1\nDEFAULT_ACTIVE=1\n",
            dir.path().display()
        ))
        .unwrap();
        let mut rec =
            QsoRecorder::from_config(&cfg, "QsoRecorder", "TestLogic", 16000).unwrap();

        // Pre-existing old recording larger than half the budget
        let old = dir.path().join("qsorec_TestLogic_old.wav");
        std::fs::write(&old, vec![0u8; 700 * 1024]).unwrap();
        let earlier = std::time::SystemTime::now() - std::time::Duration::from_secs(3600);
        let _ = filetime_set(&old, earlier);

        let mut port = rec.add_source(0);
        port.write(&vec![1; 400 * 1024]); // ~800 KB of samples
        port.flush();
        rec.tick(0);
        rec.finalize(60_000);

        // The new chunk pushed the directory over 1 MB; the old file goes
        assert!(!old.exists());
        assert_eq!(kept_chunks(dir.path()).len(), 1);
    }

    fn filetime_set(path: &std::path::Path, t: std::time::SystemTime) -> std::io::Result<()> {
        let f = std::fs::OpenOptions::new().write(true).open(path)?;
        f.set_modified(t)
    }
}
