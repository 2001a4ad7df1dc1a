//! Per-stage audit records for forensic replay.
//!
//! Every fetch-pipeline stage drops one JSON file under
//! `logs/audit/<date>/`. Audit failures are logged and counted but never
//! interrupt the scraping path.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use crate::metrics::Metrics;

pub struct AuditLog {
    dir: PathBuf,
    metrics: Arc<Metrics>,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>, metrics: Arc<Metrics>) -> Self {
        Self {
            dir: dir.into(),
            metrics,
        }
    }

    /// Writes one audit record. `html` is recorded by length only.
    pub fn record(
        &self,
        stage: &str,
        url: &str,
        payload: serde_json::Value,
        html: Option<&str>,
        details: Option<serde_json::Value>,
        error_msg: Option<&str>,
    ) {
        let start = Instant::now();
        let now = Utc::now();
        let date_dir = self.dir.join(now.format("%Y-%m-%d").to_string());

        let rand8 = &Uuid::new_v4().simple().to_string()[..8];
        let filename = format!("{}_{}_{}.json", now.format("%H-%M-%S"), rand8, stage);
        let filepath = date_dir.join(filename);

        let record = json!({
            "timestamp": now.to_rfc3339(),
            "stage": stage,
            "url": url,
            "payload": payload,
            "html_length": html.map(|h| h.len()),
            "details": details,
            "error": error_msg,
        });

        self.metrics.audit_records_total.inc(stage);

        let write = std::fs::create_dir_all(&date_dir).and_then(|_| {
            std::fs::write(
                &filepath,
                serde_json::to_vec_pretty(&record).unwrap_or_default(),
            )
        });
        if let Err(err) = write {
            self.metrics.audit_errors_total.inc(stage);
            error!(path = %filepath.display(), error = %err, "audit write failed");
            return;
        }

        self.metrics
            .audit_record_duration_seconds
            .observe(start.elapsed().as_secs_f64());
    }

    /// Counts records per stage across all date directories; feeds the
    /// periodic audit metrics task.
    pub fn count_by_stage(&self) -> Vec<(String, u64)> {
        let mut counts: std::collections::HashMap<String, u64> = std::collections::HashMap::new();
        let Ok(dates) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        for date in dates.flatten() {
            let Ok(files) = std::fs::read_dir(date.path()) else {
                continue;
            };
            for file in files.flatten() {
                let name = file.file_name().to_string_lossy().to_string();
                if !name.ends_with(".json") {
                    continue;
                }
                // <time>_<rand8>_<stage>.json
                if let Some(stage) = name
                    .trim_end_matches(".json")
                    .splitn(3, '_')
                    .nth(2)
                {
                    *counts.entry(stage.to_string()).or_insert(0) += 1;
                }
            }
        }
        let mut out: Vec<(String, u64)> = counts.into_iter().collect();
        out.sort();
        out
    }
}
