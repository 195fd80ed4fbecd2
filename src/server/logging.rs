//! Usage metrics, access logging, and metrics persistence.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::detector::Prediction;

/// Maximum number of rotated access log files to keep.
const MAX_ACCESS_LOG_ROTATIONS: usize = 5;

/// Interval in seconds between metrics persistence to disk.
pub const METRICS_PERSIST_INTERVAL_SECS: u64 = 60;

/// One scored row, as written to the access log.
pub struct RecordEvent<'a> {
    pub endpoint: &'a str,
    pub prediction: &'a Prediction,
    pub processing_time_ms: u64,
}

pub struct UsageMetrics {
    pub total_requests: AtomicU64,
    pub total_errors: AtomicU64,

    pub benign: AtomicU64,
    pub attacks: AtomicU64,

    pub ep_predict: AtomicU64,
    pub ep_upload_csv: AtomicU64,
    pub ep_test_preprocessing: AtomicU64,
    pub ep_signup: AtomicU64,
    pub ep_login: AtomicU64,
    pub ep_verify: AtomicU64,
    pub ep_stats: AtomicU64,

    pub batch_rows: AtomicU64,
    pub batch_failed_rows: AtomicU64,

    pub access_log: std::sync::Mutex<Option<File>>,
    access_log_path: PathBuf,
    access_log_bytes: AtomicU64,
    max_access_log_bytes: u64,
    metrics_path: PathBuf,
}

impl UsageMetrics {
    pub fn new(access_log_path: &Path, max_access_log_bytes: u64, data_dir: &Path) -> Self {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(access_log_path)
            .ok();
        if file.is_none() {
            warn!(path = %access_log_path.display(), "could not open access log");
        }
        let current_size = std::fs::metadata(access_log_path)
            .map(|m| m.len())
            .unwrap_or(0);

        Self {
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            benign: AtomicU64::new(0),
            attacks: AtomicU64::new(0),
            ep_predict: AtomicU64::new(0),
            ep_upload_csv: AtomicU64::new(0),
            ep_test_preprocessing: AtomicU64::new(0),
            ep_signup: AtomicU64::new(0),
            ep_login: AtomicU64::new(0),
            ep_verify: AtomicU64::new(0),
            ep_stats: AtomicU64::new(0),
            batch_rows: AtomicU64::new(0),
            batch_failed_rows: AtomicU64::new(0),
            access_log: std::sync::Mutex::new(file),
            access_log_path: access_log_path.to_path_buf(),
            access_log_bytes: AtomicU64::new(current_size),
            max_access_log_bytes,
            metrics_path: data_dir.join("metrics.json"),
        }
    }

    /// Count a successful prediction and append it to the access log.
    pub fn record(&self, event: &RecordEvent<'_>) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.count_prediction(event.prediction);
        self.append_access_log(event);
    }

    /// Count a batch row without touching the request counter.
    pub fn record_batch_row(&self, event: &RecordEvent<'_>) {
        self.batch_rows.fetch_add(1, Ordering::Relaxed);
        self.count_prediction(event.prediction);
        self.append_access_log(event);
    }

    pub fn record_batch_failure(&self) {
        self.batch_rows.fetch_add(1, Ordering::Relaxed);
        self.batch_failed_rows.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a completed request that produced no prediction.
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn count_prediction(&self, prediction: &Prediction) {
        if prediction.attack.is_vulnerable {
            self.attacks.fetch_add(1, Ordering::Relaxed);
        } else {
            self.benign.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn append_access_log(&self, event: &RecordEvent<'_>) {
        let Ok(mut guard) = self.access_log.try_lock() else {
            return;
        };
        let Some(ref mut file) = *guard else {
            return;
        };

        let entry = serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "endpoint": event.endpoint,
            "prediction": event.prediction.class_id,
            "attack_type": event.prediction.attack.attack_type,
            "is_vulnerable": event.prediction.attack.is_vulnerable,
            "top_features": event.prediction.top_features,
            "features_used": event.prediction.features_used,
            "processing_time_ms": event.processing_time_ms,
        });
        let mut line = entry.to_string();
        line.push('\n');
        let line_len = line.len() as u64;
        if let Err(e) = file.write_all(line.as_bytes()) {
            warn!(error = %e, "failed to write access log entry");
        }
        let new_size = self.access_log_bytes.fetch_add(line_len, Ordering::Relaxed) + line_len;

        // Rotate if over size limit (0 = no limit)
        if self.max_access_log_bytes > 0 && new_size >= self.max_access_log_bytes {
            let path = self.access_log_path.display().to_string();
            for i in (1..MAX_ACCESS_LOG_ROTATIONS).rev() {
                let from = format!("{}.{}", path, i);
                let to = format!("{}.{}", path, i + 1);
                if Path::new(&from).exists() {
                    if let Err(e) = std::fs::rename(&from, &to) {
                        warn!(from = %from, to = %to, error = %e, "log rotation rename failed");
                    }
                }
            }
            let rotated = format!("{}.1", path);
            if let Err(e) = std::fs::rename(&self.access_log_path, &rotated) {
                warn!(from = %path, to = %rotated, error = %e, "log rotation rename failed");
            }
            if let Ok(new_file) = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.access_log_path)
            {
                *file = new_file;
                self.access_log_bytes.store(0, Ordering::Relaxed);
            }
        }
    }

    /// Persist current metrics snapshot to disk so they survive restarts.
    pub fn persist_to_disk(&self) {
        let snapshot = serde_json::json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "total_requests": self.total_requests.load(Ordering::Relaxed),
            "total_errors": self.total_errors.load(Ordering::Relaxed),
            "benign": self.benign.load(Ordering::Relaxed),
            "attacks": self.attacks.load(Ordering::Relaxed),
            "ep_predict": self.ep_predict.load(Ordering::Relaxed),
            "ep_upload_csv": self.ep_upload_csv.load(Ordering::Relaxed),
            "ep_test_preprocessing": self.ep_test_preprocessing.load(Ordering::Relaxed),
            "ep_signup": self.ep_signup.load(Ordering::Relaxed),
            "ep_login": self.ep_login.load(Ordering::Relaxed),
            "ep_verify": self.ep_verify.load(Ordering::Relaxed),
            "ep_stats": self.ep_stats.load(Ordering::Relaxed),
            "batch_rows": self.batch_rows.load(Ordering::Relaxed),
            "batch_failed_rows": self.batch_failed_rows.load(Ordering::Relaxed),
        });
        match serde_json::to_vec_pretty(&snapshot) {
            Ok(data) => {
                if let Err(e) = std::fs::write(&self.metrics_path, &data) {
                    warn!(path = %self.metrics_path.display(), error = %e, "failed to persist metrics");
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to serialize metrics snapshot");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::tests::sample_detector;

    #[test]
    fn test_counters() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = UsageMetrics::new(&dir.path().join("access.jsonl"), 0, dir.path());
        let detector = sample_detector();

        let benign = detector.predict(&[1.0, 0.0, 5.0]).unwrap();
        let attack = detector.predict(&[9.0, 0.0, 5.0]).unwrap();
        metrics.record(&RecordEvent {
            endpoint: "predict",
            prediction: &benign,
            processing_time_ms: 1,
        });
        metrics.record_batch_row(&RecordEvent {
            endpoint: "upload-csv",
            prediction: &attack,
            processing_time_ms: 1,
        });
        metrics.record_batch_failure();
        metrics.record_error();

        assert_eq!(metrics.total_requests.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.total_errors.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.benign.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.attacks.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.batch_rows.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.batch_failed_rows.load(Ordering::Relaxed), 1);

        let log = std::fs::read_to_string(dir.path().join("access.jsonl")).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["endpoint"], "predict");
        assert_eq!(first["attack_type"], "Benign");
    }

    #[test]
    fn test_access_log_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("access.jsonl");
        let metrics = UsageMetrics::new(&log_path, 64, dir.path());
        let prediction = sample_detector().predict(&[9.0, 5.0, 20.0]).unwrap();
        for _ in 0..3 {
            metrics.record(&RecordEvent {
                endpoint: "predict",
                prediction: &prediction,
                processing_time_ms: 0,
            });
        }
        assert!(dir.path().join("access.jsonl.1").exists());
    }

    #[test]
    fn test_persist_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = UsageMetrics::new(&dir.path().join("access.jsonl"), 0, dir.path());
        metrics.ep_predict.fetch_add(3, Ordering::Relaxed);
        metrics.persist_to_disk();
        let raw = std::fs::read(dir.path().join("metrics.json")).unwrap();
        let snapshot: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(snapshot["ep_predict"], 3);
    }
}
