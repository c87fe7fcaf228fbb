//! `grib2json` wrapper.
//!
//! Runs the converter as a child process against a staged GRIB file and
//! returns the JSON it produced. The converter writes to a sibling
//! `<raw>.json` file which is always removed afterwards.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use common::config::ConverterConfig;
use common::{Converter, Error, SnapshotKey};
use tokio::process::Command;
use tracing::{debug, warn};

const STDERR_EXCERPT: usize = 500;

#[derive(Debug, Clone)]
pub struct Grib2JsonConverter {
    command: PathBuf,
    timeout: Duration,
}

impl Grib2JsonConverter {
    pub fn new(config: &ConverterConfig) -> Self {
        Self {
            command: config.command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

#[async_trait]
impl Converter for Grib2JsonConverter {
    async fn convert(&self, key: &SnapshotKey, raw: &Path) -> Result<Vec<u8>, Error> {
        let output_path = raw.with_extension("json");
        debug!(
            "Converting {} with {} -> {}",
            raw.display(),
            self.command.display(),
            output_path.display()
        );

        let mut cmd = Command::new(&self.command);
        cmd.arg("--data")
            .arg("--output")
            .arg(&output_path)
            .arg("--names")
            .arg("--compact")
            .arg(raw)
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(Error::Conversion(format!(
                    "failed to launch {}: {}",
                    self.command.display(),
                    e
                )));
            }
            Err(_) => {
                remove_quietly(&output_path).await;
                return Err(Error::Conversion(format!(
                    "grib2json timed out after {}s for {}",
                    self.timeout.as_secs(),
                    key
                )));
            }
        };

        if !output.status.success() {
            remove_quietly(&output_path).await;
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.chars().take(STDERR_EXCERPT).collect();
            return Err(Error::Conversion(format!(
                "grib2json exited with {} for {}: {}",
                output.status,
                key,
                excerpt.trim()
            )));
        }

        let payload = tokio::fs::read(&output_path).await.map_err(|e| {
            Error::Conversion(format!(
                "grib2json produced no readable output for {key}: {e}"
            ))
        });
        remove_quietly(&output_path).await;
        payload
    }
}
