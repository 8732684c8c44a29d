use std::path::{Path, PathBuf};

/// Per-run debug artifact writer: one screenshot + observation/action JSON
/// pair per completed iteration, under `runs/<timestamp>_<id>/`.
///
/// Writes are fire-and-forget: a failed write is logged and ignored, never
/// escalated into the control flow.
pub struct TraceWriter {
    run_dir: Option<PathBuf>,
}

impl TraceWriter {
    /// Creates the run directory under `base_dir`. On failure the writer is
    /// disabled rather than erroring, the run matters more than its
    /// artifacts.
    pub fn create(base_dir: &Path) -> Self {
        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let dir_name = format!(
            "{}_{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S"),
            &run_id[..8]
        );
        let run_dir = base_dir.join(dir_name);
        match std::fs::create_dir_all(&run_dir) {
            Ok(()) => {
                tracing::info!(dir = %run_dir.display(), "trace directory created");
                Self {
                    run_dir: Some(run_dir),
                }
            }
            Err(e) => {
                tracing::warn!(dir = %run_dir.display(), error = %e, "trace directory unavailable; tracing disabled");
                Self { run_dir: None }
            }
        }
    }

    pub fn disabled() -> Self {
        Self { run_dir: None }
    }

    pub fn run_dir(&self) -> Option<&Path> {
        self.run_dir.as_deref()
    }

    pub fn save_screenshot(&self, step: u32, png: &[u8]) {
        let Some(dir) = &self.run_dir else { return };
        let path = dir.join(format!("step_{step:02}.png"));
        if let Err(e) = std::fs::write(&path, png) {
            tracing::warn!(path = %path.display(), error = %e, "screenshot write failed");
        }
    }

    pub fn save_json(&self, step: u32, suffix: &str, value: &serde_json::Value) {
        let Some(dir) = &self.run_dir else { return };
        let path = dir.join(format!("step_{step:02}_{suffix}.json"));
        match serde_json::to_vec_pretty(value) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    tracing::warn!(path = %path.display(), error = %e, "trace write failed");
                }
            }
            Err(e) => tracing::warn!(suffix, error = %e, "trace serialization failed"),
        }
    }

    /// Final run report, written once at the end.
    pub fn save_result(&self, value: &serde_json::Value) {
        let Some(dir) = &self.run_dir else { return };
        let path = dir.join("result.json");
        match serde_json::to_vec_pretty(value) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    tracing::warn!(path = %path.display(), error = %e, "result write failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "result serialization failed"),
        }
    }
}
