//! Optional per-call PCM capture for internal quality review.
//!
//! Disabled by default. When armed, inbound and outbound frames of a call
//! are appended to a raw PCM file under a per-call size cap; a janitor
//! removes captures past the retention window. Arming requires the
//! explicit operator opt-in when audio also egresses to a provider.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::core::audio::AudioFrame;

/// Per-call capture cap: 50 MiB, roughly 27 minutes of duplex audio.
pub const MAX_CAPTURE_BYTES: u64 = 50 * 1024 * 1024;

/// Recorder settings derived from the server configuration.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Master switch; when false every operation is a no-op.
    pub enabled: bool,
    pub directory: PathBuf,
    pub retention: Duration,
    pub max_bytes_per_call: u64,
}

impl RecorderConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::from("./data/recordings"),
            retention: Duration::from_secs(24 * 3600),
            max_bytes_per_call: MAX_CAPTURE_BYTES,
        }
    }

    pub fn from_server(config: &crate::config::ServerConfig) -> Self {
        Self {
            enabled: config.recorder_armed(),
            directory: config.record_path.clone(),
            retention: Duration::from_secs(config.record_retention_hours * 3600),
            max_bytes_per_call: MAX_CAPTURE_BYTES,
        }
    }
}

/// Raw PCM sink for one call.
pub struct CaptureSink {
    call_id: String,
    file: Mutex<File>,
    meta_path: PathBuf,
    written: AtomicU64,
    cap: u64,
    started: SystemTime,
}

impl CaptureSink {
    fn open(directory: &Path, call_id: &str, cap: u64) -> std::io::Result<Self> {
        let dir = directory.join(call_id);
        fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("capture.pcm"))?;
        let meta_path = dir.join("meta.txt");
        let started = SystemTime::now();
        fs::write(
            &meta_path,
            format!(
                "call_id={call_id}\nstart_ts={}\nsample_rate=16000\nchannels=1\nbit_depth=16\n",
                unix_secs(started)
            ),
        )?;
        info!(call = %call_id, "audio capture started");
        Ok(Self {
            call_id: call_id.to_string(),
            file: Mutex::new(file),
            meta_path,
            written: AtomicU64::new(0),
            cap,
            started,
        })
    }

    /// Append one frame's PCM. Writes past the cap are dropped.
    pub fn write_frame(&self, frame: &AudioFrame) {
        let len = frame.pcm.len() as u64;
        let before = self.written.fetch_add(len, Ordering::Relaxed);
        if before + len > self.cap {
            self.written.fetch_sub(len, Ordering::Relaxed);
            debug!(call = %self.call_id, "capture cap reached, frame dropped");
            return;
        }
        let mut file = self.file.lock();
        if let Err(e) = file.write_all(&frame.pcm) {
            warn!(call = %self.call_id, "capture write failed: {e}");
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    fn finalize(&self) {
        {
            let mut file = self.file.lock();
            let _ = file.flush();
            let _ = file.sync_all();
        }
        let duration = self
            .started
            .elapsed()
            .unwrap_or_default()
            .as_secs_f64();
        if let Ok(existing) = fs::read_to_string(&self.meta_path) {
            let _ = fs::write(
                &self.meta_path,
                format!(
                    "{existing}end_ts={}\nduration_sec={duration:.2}\nbytes={}\n",
                    unix_secs(SystemTime::now()),
                    self.bytes_written()
                ),
            );
        }
        info!(call = %self.call_id, seconds = duration, "audio capture finalized");
    }
}

/// Manages capture sinks across calls and runs the retention janitor.
pub struct CallRecorder {
    config: RecorderConfig,
    active: Mutex<HashMap<String, Arc<CaptureSink>>>,
}

impl CallRecorder {
    pub fn new(config: RecorderConfig) -> Self {
        Self {
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Start a capture for a call; `None` when recording is off or the sink
    /// cannot be opened.
    pub fn start(&self, call_id: &str) -> Option<Arc<CaptureSink>> {
        if !self.config.enabled {
            return None;
        }
        match CaptureSink::open(
            &self.config.directory,
            call_id,
            self.config.max_bytes_per_call,
        ) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                self.active
                    .lock()
                    .insert(call_id.to_string(), Arc::clone(&sink));
                Some(sink)
            }
            Err(e) => {
                warn!(call = %call_id, "capture could not start: {e}");
                None
            }
        }
    }

    /// Flush and finalize a call's capture.
    pub fn stop(&self, call_id: &str) {
        if let Some(sink) = self.active.lock().remove(call_id) {
            sink.finalize();
        }
    }

    /// Remove captures older than the retention window. Returns the number
    /// of removed call directories.
    pub fn sweep(&self) -> usize {
        if !self.config.enabled {
            return 0;
        }
        let cutoff = SystemTime::now() - self.config.retention;
        let mut removed = 0;
        let entries = match fs::read_dir(&self.config.directory) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let too_old = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|modified| modified < cutoff)
                .unwrap_or(false);
            if too_old {
                if fs::remove_dir_all(&path).is_ok() {
                    removed += 1;
                    info!(path = %path.display(), "expired capture removed");
                }
            }
        }
        removed
    }

    /// Periodic retention sweep; spawned once at boot when enabled.
    pub async fn run_janitor(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let recorder = Arc::clone(&self);
            let _ = tokio::task::spawn_blocking(move || recorder.sweep()).await;
        }
    }
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audio::pcm_from_samples;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> RecorderConfig {
        RecorderConfig {
            enabled: true,
            directory: dir.path().to_path_buf(),
            retention: Duration::from_secs(3600),
            max_bytes_per_call: 4096,
        }
    }

    fn frame(seq: u64) -> AudioFrame {
        AudioFrame::new(seq, seq * 20, pcm_from_samples(&[100i16; 320]))
    }

    #[test]
    fn test_disabled_recorder_is_noop() {
        let recorder = CallRecorder::new(RecorderConfig::disabled());
        assert!(recorder.start("call-1").is_none());
        assert_eq!(recorder.sweep(), 0);
    }

    #[test]
    fn test_capture_writes_pcm_and_meta() {
        let dir = TempDir::new().unwrap();
        let recorder = CallRecorder::new(config(&dir));

        let sink = recorder.start("call-1").unwrap();
        sink.write_frame(&frame(0));
        sink.write_frame(&frame(1));
        recorder.stop("call-1");

        let pcm = fs::read(dir.path().join("call-1/capture.pcm")).unwrap();
        assert_eq!(pcm.len(), 2 * 640);
        let meta = fs::read_to_string(dir.path().join("call-1/meta.txt")).unwrap();
        assert!(meta.contains("call_id=call-1"));
        assert!(meta.contains("bytes=1280"));
    }

    #[test]
    fn test_capture_respects_size_cap() {
        let dir = TempDir::new().unwrap();
        let recorder = CallRecorder::new(config(&dir));

        let sink = recorder.start("call-cap").unwrap();
        // Cap is 4096 bytes = 6.4 frames; the 7th must be dropped
        for seq in 0..10 {
            sink.write_frame(&frame(seq));
        }
        assert!(sink.bytes_written() <= 4096);
        recorder.stop("call-cap");

        let pcm = fs::read(dir.path().join("call-cap/capture.pcm")).unwrap();
        assert!(pcm.len() as u64 <= 4096);
    }

    #[test]
    fn test_sweep_removes_only_old_captures() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.retention = Duration::from_secs(0);
        let recorder = CallRecorder::new(cfg);

        let sink = recorder.start("call-old").unwrap();
        sink.write_frame(&frame(0));
        recorder.stop("call-old");

        // Zero retention: everything qualifies
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(recorder.sweep(), 1);
        assert!(!dir.path().join("call-old").exists());
    }
}
