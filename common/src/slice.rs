//! Batch slicing.
//!
//! Splits the file list into numbered batch descriptors of at most `batch_size` paths each. The
//! descriptors land in the `todo` queue where the scheduler picks them up.

use anyhow::{Context, anyhow};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::instrument;

use crate::lines;
use crate::project;

#[derive(Copy, Clone, Debug, Default)]
pub struct Summary {
    pub lines: u64,
    pub batches: u64,
    pub failed_batches: u64,
    pub failed_lines: u64,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            lines: self.lines + other.lines,
            batches: self.batches + other.batches,
            failed_batches: self.failed_batches + other.failed_batches,
            failed_lines: self.failed_lines + other.failed_lines,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "files sliced: {}\n\
            batches created: {}\n\
            batches failed: {}\n\
            lines failed: {}",
            self.lines, self.batches, self.failed_batches, self.failed_lines,
        )
    }
}

#[must_use]
pub fn batch_count(lines: u64, batch_size: u64) -> u64 {
    lines.div_ceil(batch_size)
}

/// Number of decimal digits of `batches`, at least 1.
#[must_use]
pub fn padding_width(batches: u64) -> usize {
    let mut width = 1;
    let mut rest = batches / 10;
    while rest > 0 {
        width += 1;
        rest /= 10;
    }
    width
}

struct Batch {
    id: u64,
    path: std::path::PathBuf,
    writer: Option<tokio::io::BufWriter<tokio::fs::File>>,
}

async fn record<E: AsyncWrite + Unpin>(errors: &mut E, message: &str) -> anyhow::Result<()> {
    tracing::error!("{}", message);
    errors
        .write_all(format!("{message}\n").as_bytes())
        .await
        .context("failed writing slice errors")
}

async fn open_batch<E: AsyncWrite + Unpin>(
    todo_dir: &std::path::Path,
    id: u64,
    width: usize,
    errors: &mut E,
    summary: &mut Summary,
) -> anyhow::Result<Batch> {
    let path = todo_dir.join(project::batch_file_name(id, width));
    let writer = match tokio::fs::File::create(&path).await {
        Ok(file) => {
            tracing::debug!("created batch {:?}", &path);
            summary.batches += 1;
            Some(tokio::io::BufWriter::new(file))
        }
        Err(error) => {
            tracing::debug!("{:?}: {}", &path, &error);
            record(
                errors,
                &format!("failed to create batch file. batch_number: {id}"),
            )
            .await?;
            summary.failed_batches += 1;
            None
        }
    };
    Ok(Batch { id, path, writer })
}

async fn close_batch<E: AsyncWrite + Unpin>(batch: Batch, errors: &mut E) -> anyhow::Result<()> {
    let Some(mut writer) = batch.writer else {
        return Ok(());
    };
    if let Err(error) = writer.flush().await {
        record(
            errors,
            &format!(
                "failed to flush batch file. batch_number: {}, path: {}, error: {}",
                batch.id,
                batch.path.display(),
                error
            ),
        )
        .await?;
    }
    Ok(())
}

/// Slices `file_list` into `todo_dir`.
///
/// Failing to create a batch or to write a line is recorded in `errors` and slicing goes on; only
/// problems with the input list or with `errors` itself are returned as errors.
#[instrument(skip(errors))]
pub async fn slice<E: AsyncWrite + Unpin>(
    file_list: &std::path::Path,
    batch_size: u64,
    todo_dir: &std::path::Path,
    done_dir: &std::path::Path,
    mut errors: E,
) -> anyhow::Result<Summary> {
    if batch_size == 0 {
        return Err(anyhow!("batch size must be greater than 0"));
    }
    for dir in [todo_dir, done_dir] {
        let metadata = tokio::fs::metadata(dir)
            .await
            .with_context(|| format!("batches queue {dir:?} is not accessible"))?;
        if !metadata.is_dir() {
            return Err(anyhow!("batches queue {dir:?} is not a directory"));
        }
    }
    let open_list = || async {
        tokio::fs::File::open(file_list)
            .await
            .with_context(|| format!("cannot open file list {file_list:?}"))
    };
    let total = lines::count_paths(open_list().await?)
        .await
        .with_context(|| format!("failed reading file list {file_list:?}"))?;
    let width = padding_width(batch_count(total, batch_size));
    let mut summary = Summary::default();
    let mut segments = tokio::io::BufReader::new(open_list().await?).split(b'\n');
    let mut current: Option<Batch> = None;
    let mut index: u64 = 0;
    while let Some(line) = segments
        .next_segment()
        .await
        .with_context(|| format!("failed reading file list {file_list:?}"))?
    {
        let Some(path) = lines::path_from_line(line) else {
            continue;
        };
        if index % batch_size == 0 {
            if let Some(batch) = current.take() {
                close_batch(batch, &mut errors).await?;
            }
            let id = index / batch_size + 1;
            current = Some(open_batch(todo_dir, id, width, &mut errors, &mut summary).await?);
        }
        index += 1;
        summary.lines += 1;
        let Some(batch) = current.as_mut() else {
            continue;
        };
        let Some(writer) = batch.writer.as_mut() else {
            summary.failed_lines += 1;
            record(
                &mut errors,
                &format!(
                    "failed to write line. line: {}, error: batch {} could not be created",
                    path.display(),
                    batch.id
                ),
            )
            .await?;
            continue;
        };
        if let Err(error) = lines::write_path(writer, &path).await {
            summary.failed_lines += 1;
            record(
                &mut errors,
                &format!(
                    "failed to write line. line: {}, error: {}",
                    path.display(),
                    error
                ),
            )
            .await?;
        }
    }
    if let Some(batch) = current.take() {
        close_batch(batch, &mut errors).await?;
    }
    errors.flush().await.context("failed flushing slice errors")?;
    tracing::info!("slicing finished: {:?}", &summary);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use crate::project::BatchesDir;
    use proptest::prelude::*;
    use tracing_test::traced_test;

    use super::*;

    async fn write_file_list(dir: &std::path::Path, count: usize) -> std::path::PathBuf {
        let file_list = dir.join("files.log");
        let body: String = (0..count).map(|i| format!("/src/file_{i}\n")).collect();
        tokio::fs::write(&file_list, body).await.unwrap();
        file_list
    }

    async fn line_count(path: &std::path::Path) -> usize {
        tokio::fs::read_to_string(path).await.unwrap().lines().count()
    }

    #[test]
    fn padding_width_is_digit_count() {
        assert_eq!(padding_width(0), 1);
        assert_eq!(padding_width(1), 1);
        assert_eq!(padding_width(9), 1);
        assert_eq!(padding_width(10), 2);
        assert_eq!(padding_width(99), 2);
        assert_eq!(padding_width(100), 3);
    }

    proptest! {
        #[test]
        fn batches_cover_lines_within_bound(lines in 0u64..100_000, batch_size in 1u64..5_000) {
            let batches = batch_count(lines, batch_size);
            prop_assert!(batches * batch_size >= lines);
            if batches > 0 {
                prop_assert!((batches - 1) * batch_size < lines);
            }
            prop_assert_eq!(padding_width(batches), batches.max(1).to_string().len());
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn slices_into_bounded_batches() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let file_list = write_file_list(tmp_dir.path(), 2500).await;
        let batches = BatchesDir::new(tmp_dir.path().join("batches"));
        batches.create().await?;
        let mut errors = vec![];
        let summary = slice(&file_list, 1000, &batches.todo(), &batches.done(), &mut errors).await?;
        assert_eq!(summary.lines, 2500);
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.failed_lines, 0);
        assert!(errors.is_empty());
        let pending = batches.pending().await?;
        assert_eq!(
            pending,
            vec![
                batches.todo().join("1.log"),
                batches.todo().join("2.log"),
                batches.todo().join("3.log"),
            ]
        );
        assert_eq!(line_count(&pending[0]).await, 1000);
        assert_eq!(line_count(&pending[1]).await, 1000);
        assert_eq!(line_count(&pending[2]).await, 500);
        let mut all = String::new();
        for batch in &pending {
            all.push_str(&tokio::fs::read_to_string(batch).await?);
        }
        assert_eq!(all, tokio::fs::read_to_string(&file_list).await?);
        assert!(batches.completed().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn pads_ids_to_batch_count_width() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let file_list = write_file_list(tmp_dir.path(), 10).await;
        let batches = BatchesDir::new(tmp_dir.path().join("batches"));
        batches.create().await?;
        let summary = slice(&file_list, 1, &batches.todo(), &batches.done(), vec![]).await?;
        assert_eq!(summary.batches, 10);
        let pending = batches.pending().await?;
        assert_eq!(pending.first(), Some(&batches.todo().join("01.log")));
        assert_eq!(pending.last(), Some(&batches.todo().join("10.log")));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn empty_list_and_blank_lines() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let file_list = tmp_dir.path().join("files.log");
        tokio::fs::write(&file_list, "\n\n").await?;
        let batches = BatchesDir::new(tmp_dir.path().join("batches"));
        batches.create().await?;
        let summary = slice(&file_list, 5, &batches.todo(), &batches.done(), vec![]).await?;
        assert_eq!(summary.lines, 0);
        assert_eq!(summary.batches, 0);
        assert!(batches.pending().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_batch_is_recorded_and_slicing_continues() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let file_list = write_file_list(tmp_dir.path(), 5).await;
        let batches = BatchesDir::new(tmp_dir.path().join("batches"));
        batches.create().await?;
        // a directory in the way makes creating the first descriptor fail
        tokio::fs::create_dir(batches.todo().join("1.log")).await?;
        let mut errors = vec![];
        let summary = slice(&file_list, 2, &batches.todo(), &batches.done(), &mut errors).await?;
        assert_eq!(summary.batches, 2);
        assert_eq!(summary.failed_batches, 1);
        assert_eq!(summary.failed_lines, 2);
        assert_eq!(
            String::from_utf8(errors)?,
            "failed to create batch file. batch_number: 1\n\
            failed to write line. line: /src/file_0, error: batch 1 could not be created\n\
            failed to write line. line: /src/file_1, error: batch 1 could not be created\n"
        );
        assert_eq!(line_count(&batches.todo().join("2.log")).await, 2);
        assert_eq!(line_count(&batches.todo().join("3.log")).await, 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn rejects_zero_batch_size_and_missing_queues() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let file_list = write_file_list(tmp_dir.path(), 1).await;
        let batches = BatchesDir::new(tmp_dir.path().join("batches"));
        assert!(
            slice(&file_list, 1, &batches.todo(), &batches.done(), vec![])
                .await
                .is_err()
        );
        batches.create().await?;
        assert!(
            slice(&file_list, 0, &batches.todo(), &batches.done(), vec![])
                .await
                .is_err()
        );
        Ok(())
    }
}
