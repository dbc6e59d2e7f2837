//! Copy requests and responses exchanged between the scheduler and the worker pool.

use anyhow::{Context, anyhow};
use tokio::io::AsyncWriteExt;
use tracing::instrument;

use crate::throttle;

pub const SUCCESS: &str = "success";
pub const CSV_HEADER: &str = "status,duration [milli-sec],target,source,error_message";

/// Maps a source path to its location under `target_root`, keeping the layout relative to
/// `src_root`.
///
/// Sources outside `src_root` are refused.
pub fn target_path(
    src_root: &std::path::Path,
    target_root: &std::path::Path,
    source: &std::path::Path,
) -> anyhow::Result<std::path::PathBuf> {
    let relative = source
        .strip_prefix(src_root)
        .map_err(|_| anyhow!("source {source:?} is outside the source root {src_root:?}"))?;
    Ok(target_root.join(relative))
}

/// Copies one regular file, creating the parent of `dst` if it is missing.
///
/// Returns the number of bytes copied.
#[instrument(skip(open_files))]
pub async fn copy_one(
    src: &std::path::Path,
    dst: &std::path::Path,
    open_files: &throttle::OpenFiles,
) -> anyhow::Result<u64> {
    let src_metadata = tokio::fs::metadata(src)
        .await
        .with_context(|| format!("failed reading metadata from {:?}", &src))?;
    if !src_metadata.is_file() {
        return Err(anyhow!("source {:?} is not a regular file", &src));
    }
    let _open_file_guard = open_files.permit().await;
    tracing::debug!("opening 'src' for reading and 'dst' for writing");
    let mut reader = tokio::fs::File::open(src)
        .await
        .with_context(|| format!("cannot open {:?} for reading", &src))?;
    let mut parent_created = false;
    let mut writer = loop {
        match tokio::fs::File::create(dst).await {
            Ok(writer) => break writer,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound && !parent_created => {
                parent_created = true;
                if let Some(parent) = dst.parent() {
                    tracing::debug!("creating missing parent {:?}", parent);
                    tokio::fs::create_dir_all(parent)
                        .await
                        .with_context(|| format!("cannot create directory {parent:?}"))?;
                }
            }
            Err(error) => {
                return Err(error).with_context(|| format!("cannot open {dst:?} for writing"));
            }
        }
    };
    let bytes = tokio::io::copy(&mut reader, &mut writer)
        .await
        .with_context(|| format!("failed copying data to {:?}", &dst))?;
    writer
        .flush()
        .await
        .with_context(|| format!("failed flushing {:?}", &dst))?;
    Ok(bytes)
}

#[derive(Debug, Clone)]
pub struct BackupFileResponse {
    pub worker_id: usize,
    pub file_id: u64,
    pub batch_id: u64,
    pub created_at: chrono::DateTime<chrono::Local>,
    pub completed_at: chrono::DateTime<chrono::Local>,
    pub source: std::path::PathBuf,
    pub target: std::path::PathBuf,
    pub success: bool,
    pub message: String,
    pub bytes_copied: u64,
}

impl BackupFileResponse {
    /// Time from request creation to copy completion, queueing included.
    #[must_use]
    pub fn duration(&self) -> chrono::Duration {
        self.completed_at - self.created_at
    }

    /// One line of the per-batch copy log, without the trailing newline.
    #[must_use]
    pub fn csv_line(&self) -> String {
        format!(
            "{},{},{},{},{}",
            self.success,
            self.duration().num_milliseconds(),
            self.target.display(),
            self.source.display(),
            self.message
        )
    }
}

#[derive(Debug, Clone)]
pub struct BackupFileRequest {
    pub file_id: u64,
    pub batch_id: u64,
    pub created_at: chrono::DateTime<chrono::Local>,
    pub source: std::path::PathBuf,
    pub target: std::path::PathBuf,
    response_tx: async_channel::Sender<BackupFileResponse>,
}

impl BackupFileRequest {
    #[must_use]
    pub fn new(
        file_id: u64,
        batch_id: u64,
        source: std::path::PathBuf,
        target: std::path::PathBuf,
        response_tx: async_channel::Sender<BackupFileResponse>,
    ) -> Self {
        Self {
            file_id,
            batch_id,
            created_at: chrono::Local::now(),
            source,
            target,
            response_tx,
        }
    }

    /// Builds the failed response for a request that never reached a worker.
    #[must_use]
    pub fn refuse(&self, error: &anyhow::Error) -> BackupFileResponse {
        BackupFileResponse {
            worker_id: 0,
            file_id: self.file_id,
            batch_id: self.batch_id,
            created_at: self.created_at,
            completed_at: chrono::Local::now(),
            source: self.source.clone(),
            target: self.target.clone(),
            success: false,
            message: format!("{error:#}"),
            bytes_copied: 0,
        }
    }

    /// Copies the file; failures are reported in the response, never returned.
    pub async fn execute(
        &self,
        worker_id: usize,
        open_files: &throttle::OpenFiles,
    ) -> BackupFileResponse {
        let result = copy_one(&self.source, &self.target, open_files).await;
        let completed_at = chrono::Local::now();
        let (success, message, bytes_copied) = match result {
            Ok(bytes) => (true, SUCCESS.to_string(), bytes),
            Err(error) => {
                tracing::error!("{:#}", &error);
                (false, format!("{error:#}"), 0)
            }
        };
        BackupFileResponse {
            worker_id,
            file_id: self.file_id,
            batch_id: self.batch_id,
            created_at: self.created_at,
            completed_at,
            source: self.source.clone(),
            target: self.target.clone(),
            success,
            message,
            bytes_copied,
        }
    }

    /// Executes the request and sends the response back to the batch that issued it.
    pub async fn handle(
        self,
        worker_id: usize,
        open_files: &throttle::OpenFiles,
    ) -> anyhow::Result<()> {
        let response = self.execute(worker_id, open_files).await;
        self.response_tx.send(response).await.map_err(|_| {
            anyhow!(
                "response channel of batch {} closed before {:?} was reported",
                self.batch_id,
                &self.source
            )
        })
    }
}

/// Messages accepted by the copy workers.
#[derive(Debug)]
pub enum Request {
    Copy(BackupFileRequest),
    Quit,
}
