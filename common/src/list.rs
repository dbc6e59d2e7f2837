//! Source enumeration.
//!
//! Walks the source tree once and routes every entry to one of three line-oriented outputs:
//! directories, regular files and errors. With a reference time only entries modified strictly
//! after it are listed (differential backup), but the walk still descends into every directory.

use std::os::unix::ffi::OsStrExt;

use anyhow::Context;
use async_recursion::async_recursion;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::instrument;

use crate::lines;

pub const UNEXPECTED_ELEMENT: &str = "unexpected_element";
pub const UNREPRESENTABLE_NAME: &str = "unrepresentable_name";

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("source root directory cannot be blank")]
    Blank,
    #[error("source root {0:?} must be accessible")]
    Inaccessible(std::path::PathBuf),
    #[error("source root {0:?} must be a directory path")]
    NotADirectory(std::path::PathBuf),
    #[error("source root {0:?} must be readable")]
    Unreadable(std::path::PathBuf),
}

/// Checks that `path` is an existing, readable directory.
pub async fn check_dir_readable(path: &std::path::Path) -> Result<(), ValidationError> {
    if path.as_os_str().is_empty() {
        return Err(ValidationError::Blank);
    }
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|_| ValidationError::Inaccessible(path.to_path_buf()))?;
    if !metadata.is_dir() {
        return Err(ValidationError::NotADirectory(path.to_path_buf()));
    }
    let entries = tokio::fs::read_dir(path)
        .await
        .map_err(|_| ValidationError::Unreadable(path.to_path_buf()))?;
    drop(entries);
    Ok(())
}

#[derive(Copy, Clone, Debug, Default)]
pub struct Summary {
    pub directories: usize,
    pub files: usize,
    pub errors: usize,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            directories: self.directories + other.directories,
            files: self.files + other.files,
            errors: self.errors + other.errors,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "directories listed: {}\n\
            files listed: {}\n\
            listing errors: {}",
            self.directories, self.files, self.errors,
        )
    }
}

/// Lists hold one path per line, so a name with a line break cannot be listed.
fn breaks_line(path: &std::path::Path) -> bool {
    path.as_os_str().as_bytes().contains(&b'\n')
}

/// Path as written to the errors output, escaped when it would break the line.
fn shown(path: &std::path::Path) -> String {
    if breaks_line(path) {
        format!("{path:?}")
    } else {
        path.display().to_string()
    }
}

fn type_tag(file_type: &std::fs::FileType) -> &'static str {
    use std::os::unix::fs::FileTypeExt;
    if file_type.is_symlink() {
        "symlink"
    } else if file_type.is_fifo() {
        "fifo"
    } else if file_type.is_socket() {
        "socket"
    } else if file_type.is_block_device() {
        "block_device"
    } else if file_type.is_char_device() {
        "char_device"
    } else {
        "unknown"
    }
}

pub struct SourceLister<D, F, E> {
    src_root: std::path::PathBuf,
    reference_time: Option<chrono::DateTime<chrono::Local>>,
    dirs: tokio::io::BufWriter<D>,
    files: tokio::io::BufWriter<F>,
    errors: tokio::io::BufWriter<E>,
    summary: Summary,
}

impl<D, F, E> SourceLister<D, F, E>
where
    D: AsyncWrite + Unpin + Send,
    F: AsyncWrite + Unpin + Send,
    E: AsyncWrite + Unpin + Send,
{
    pub async fn new(
        src_root: &std::path::Path,
        dirs: D,
        files: F,
        errors: E,
        reference_time: Option<chrono::DateTime<chrono::Local>>,
    ) -> Result<Self, ValidationError> {
        check_dir_readable(src_root).await?;
        Ok(Self {
            src_root: src_root.to_path_buf(),
            reference_time,
            dirs: tokio::io::BufWriter::new(dirs),
            files: tokio::io::BufWriter::new(files),
            errors: tokio::io::BufWriter::new(errors),
            summary: Summary::default(),
        })
    }

    /// Walks the source tree and flushes all three outputs.
    ///
    /// Per-entry problems end up in the errors output; only a failure to write an output is
    /// returned as an error.
    #[instrument(skip(self), fields(src_root = ?self.src_root))]
    pub async fn list(&mut self) -> anyhow::Result<Summary> {
        self.summary = Summary::default();
        let root = self.src_root.clone();
        // the root is followed even when it is a symlink to a directory
        match tokio::fs::metadata(&root).await {
            Ok(metadata) => self.visit(&root, metadata).await?,
            Err(error) => self.write_error(&root, &error).await?,
        }
        self.dirs.flush().await.context("failed flushing directories list")?;
        self.files.flush().await.context("failed flushing files list")?;
        self.errors.flush().await.context("failed flushing errors list")?;
        tracing::info!("listing finished: {:?}", &self.summary);
        Ok(self.summary)
    }

    fn is_after_reference_time(&self, metadata: &std::fs::Metadata) -> bool {
        let Some(reference_time) = self.reference_time else {
            return true;
        };
        match metadata.modified() {
            Ok(modified) => chrono::DateTime::<chrono::Local>::from(modified) > reference_time,
            // listing an entry too many only costs a redundant copy
            Err(_) => true,
        }
    }

    async fn write_error(
        &mut self,
        path: &std::path::Path,
        error: &std::io::Error,
    ) -> anyhow::Result<()> {
        tracing::debug!("{:?}: {}", path, error);
        let line = format!("{}, {}\n", shown(path), error);
        self.errors
            .write_all(line.as_bytes())
            .await
            .context("failed writing errors list")?;
        self.summary.errors += 1;
        Ok(())
    }

    async fn write_unexpected(&mut self, path: &std::path::Path, tag: &str) -> anyhow::Result<()> {
        tracing::debug!("{:?}: unexpected element", path);
        let line = format!(
            "path: {}, type: {} error_msg: {}\n",
            shown(path),
            tag,
            UNEXPECTED_ELEMENT
        );
        self.errors
            .write_all(line.as_bytes())
            .await
            .context("failed writing errors list")?;
        self.summary.errors += 1;
        Ok(())
    }

    #[async_recursion]
    async fn visit(
        &mut self,
        path: &std::path::Path,
        metadata: std::fs::Metadata,
    ) -> anyhow::Result<()> {
        if breaks_line(path) {
            // neither listed nor descended into
            return self.write_unexpected(path, UNREPRESENTABLE_NAME).await;
        }
        if metadata.is_file() {
            if self.is_after_reference_time(&metadata) {
                lines::write_path(&mut self.files, path)
                    .await
                    .context("failed writing files list")?;
                self.summary.files += 1;
            }
            return Ok(());
        }
        if !metadata.is_dir() {
            return self
                .write_unexpected(path, type_tag(&metadata.file_type()))
                .await;
        }
        if self.is_after_reference_time(&metadata) {
            lines::write_path(&mut self.dirs, path)
                .await
                .context("failed writing directories list")?;
            self.summary.directories += 1;
        }
        let mut entries = match tokio::fs::read_dir(path).await {
            Ok(entries) => entries,
            Err(error) => return self.write_error(path, &error).await,
        };
        let mut children = vec![];
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => children.push(entry.path()),
                Ok(None) => break,
                Err(error) => {
                    self.write_error(path, &error).await?;
                    break;
                }
            }
        }
        drop(entries);
        // lexical order keeps the listing stable across runs
        children.sort();
        for child in children {
            match tokio::fs::symlink_metadata(&child).await {
                Ok(metadata) => self.visit(&child, metadata).await?,
                Err(error) => self.write_error(&child, &error).await?,
            }
        }
        Ok(())
    }
}

/// Lists `src_root` into three files, creating them.
pub async fn list_to_files(
    src_root: &std::path::Path,
    outputs: &crate::project::ListFiles,
    reference_time: Option<chrono::DateTime<chrono::Local>>,
) -> anyhow::Result<Summary> {
    let create = |path: std::path::PathBuf| async move {
        tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("failed to create list file {path:?}"))
    };
    let dirs = create(outputs.dirs.clone()).await?;
    let files = create(outputs.files.clone()).await?;
    let errors = create(outputs.errors.clone()).await?;
    let mut lister = SourceLister::new(src_root, dirs, files, errors, reference_time).await?;
    lister.list().await
}
