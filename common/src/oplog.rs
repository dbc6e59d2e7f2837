//! Append-only operation log (`oplog.log`) recording what each command did and when.

use anyhow::Context;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone)]
pub struct OpLog {
    path: std::path::PathBuf,
}

impl OpLog {
    #[must_use]
    pub fn new(path: std::path::PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub async fn write(&self, entry: &str) -> anyhow::Result<()> {
        let line = format!(
            "{} {}\n",
            entry,
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f %z")
        );
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open operation log {:?}", &self.path))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to write to operation log {:?}", &self.path))?;
        file.flush()
            .await
            .with_context(|| format!("failed to flush operation log {:?}", &self.path))
    }

    /// Like [`OpLog::write`] but only reports failures; used on paths that are already handling
    /// another error.
    pub async fn record(&self, entry: &str) {
        if let Err(error) = self.write(entry).await {
            tracing::error!("{:#}", &error);
        }
    }
}
