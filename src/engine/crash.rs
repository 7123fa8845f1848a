//! Crash reproducer persistence. The loop hands over every crashing
//! payload; triage and deduplication live outside the core.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::info;

/// Writes crash reproducers under `crash_dir/<session>/<sequence>.bin`
/// with a small JSON sidecar describing how the payload was produced.
pub struct CrashReporter {
    crash_dir: PathBuf,
}

impl CrashReporter {
    pub fn new(crash_dir: &Path) -> Self {
        Self {
            crash_dir: crash_dir.to_path_buf(),
        }
    }

    pub async fn report(
        &self,
        session_id: &str,
        sequence: i64,
        payload: &[u8],
        strategy: Option<&str>,
        mutators: &[String],
    ) -> Result<PathBuf> {
        let dir = self.crash_dir.join(session_id);
        let bin_path = dir.join(format!("{sequence}.bin"));
        let meta_path = dir.join(format!("{sequence}.json"));

        let metadata = serde_json::json!({
            "session_id": session_id,
            "sequence_number": sequence,
            "result": "crash",
            "payload_size": payload.len(),
            "payload_sha256": hex::encode(Sha256::digest(payload)),
            "mutation_strategy": strategy,
            "mutators_applied": mutators,
        });

        let payload = payload.to_vec();
        let write_path = bin_path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(parent) = write_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&write_path, &payload)
                .with_context(|| format!("writing {}", write_path.display()))?;
            std::fs::write(&meta_path, serde_json::to_vec_pretty(&metadata)?)
                .with_context(|| format!("writing {}", meta_path.display()))?;
            Ok(())
        })
        .await??;

        info!(session_id, sequence, path = %bin_path.display(), "crash reproducer saved");
        Ok(bin_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_reproducer_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = CrashReporter::new(dir.path());

        let path = reporter
            .report("s1", 42, b"BOOM", Some("byte_level"), &["havoc".to_string()])
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"BOOM");

        let sidecar: serde_json::Value = serde_json::from_slice(
            &std::fs::read(dir.path().join("s1").join("42.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(sidecar["sequence_number"], 42);
        assert_eq!(sidecar["mutators_applied"][0], "havoc");
    }
}
