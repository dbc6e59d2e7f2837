//! Batch scheduler.
//!
//! Feeds every pending batch descriptor through the copy worker pool, one batch at a time, and
//! moves the descriptor from `todo` to `done` once every one of its files has been reported in
//! the batch's copy log. Re-running on the same batches directory only processes what is still
//! pending.

use anyhow::{Context, anyhow};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing::instrument;

use crate::backup::{self, BackupFileRequest, BackupFileResponse, Request};
use crate::lines;
use crate::oplog::OpLog;
use crate::pool::{QuitCallback, WorkerPool};
use crate::project::{self, BatchesDir};
use crate::throttle;
use crate::waitgroup::WaitGroup;

#[derive(Debug, Clone)]
pub struct Settings {
    pub num_workers: usize,
    pub queue_len: usize,
    pub open_files: throttle::OpenFiles,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct Summary {
    pub batches_done: usize,
    pub batches_failed: usize,
    pub files_copied: usize,
    pub files_failed: usize,
    pub bytes_copied: u64,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            batches_done: self.batches_done + other.batches_done,
            batches_failed: self.batches_failed + other.batches_failed,
            files_copied: self.files_copied + other.files_copied,
            files_failed: self.files_failed + other.files_failed,
            bytes_copied: self.bytes_copied + other.bytes_copied,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes copied: {}\n\
            files copied: {}\n\
            files failed: {}\n\
            batches done: {}\n\
            batches failed: {}",
            bytesize::ByteSize(self.bytes_copied),
            self.files_copied,
            self.files_failed,
            self.batches_done,
            self.batches_failed,
        )
    }
}

/// Writes one CSV line per response until the batch closes its response channel.
///
/// Log write failures are reported but never stop the consumer: every response must still be
/// counted or the batch would wait forever.
async fn consume_responses(
    responses: async_channel::Receiver<BackupFileResponse>,
    pending: WaitGroup,
    mut log: tokio::io::BufWriter<tokio::fs::File>,
    log_path: std::path::PathBuf,
) -> Summary {
    let mut summary = Summary::default();
    while let Ok(response) = responses.recv().await {
        if response.success {
            summary.files_copied += 1;
            summary.bytes_copied += response.bytes_copied;
        } else {
            summary.files_failed += 1;
        }
        let line = format!("{}\n", response.csv_line());
        let written = async {
            log.write_all(line.as_bytes()).await?;
            log.flush().await
        }
        .await;
        if let Err(error) = written {
            tracing::error!("failed writing copy log {:?}: {}", &log_path, &error);
        }
        pending.done();
    }
    summary
}

#[derive(Debug)]
pub struct Scheduler {
    src_root: std::path::PathBuf,
    target_root: std::path::PathBuf,
    batches: BatchesDir,
    copy_log_dir: std::path::PathBuf,
    settings: Settings,
    oplog: Option<OpLog>,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        src_root: &std::path::Path,
        target_root: &std::path::Path,
        batches: BatchesDir,
        copy_log_dir: &std::path::Path,
        settings: Settings,
    ) -> Self {
        Self {
            src_root: src_root.to_path_buf(),
            target_root: target_root.to_path_buf(),
            batches,
            copy_log_dir: copy_log_dir.to_path_buf(),
            settings,
            oplog: None,
        }
    }

    #[must_use]
    pub fn with_oplog(mut self, oplog: OpLog) -> Self {
        self.oplog = Some(oplog);
        self
    }

    async fn record(&self, entry: &str) {
        if let Some(oplog) = &self.oplog {
            oplog.record(entry).await;
        }
    }

    /// Processes every pending batch and shuts the worker pool down.
    #[instrument(skip(self), fields(batches = ?self.batches.root()))]
    pub async fn run(&self) -> anyhow::Result<Summary> {
        if self.settings.num_workers == 0 {
            return Err(anyhow!("number of workers must be greater than 0"));
        }
        if self.settings.queue_len == 0 {
            return Err(anyhow!("queue length must be greater than 0"));
        }
        let pending = self.batches.pending().await?;
        tokio::fs::create_dir_all(&self.copy_log_dir)
            .await
            .with_context(|| format!("failed to create copy log directory {:?}", &self.copy_log_dir))?;
        tracing::info!("{} batches pending", pending.len());
        let (request_tx, request_rx) = async_channel::bounded(self.settings.queue_len);
        let quit_wg = WaitGroup::new();
        let on_quit: QuitCallback = {
            let quit_wg = quit_wg.clone();
            std::sync::Arc::new(move |_| quit_wg.done())
        };
        let pool = WorkerPool::start(
            self.settings.num_workers,
            &request_rx,
            &self.settings.open_files,
            &on_quit,
        );
        drop(request_rx);
        let mut summary = Summary::default();
        for descriptor in pending {
            match self.process_batch(&request_tx, &descriptor).await {
                Ok(batch_summary) => summary = summary + batch_summary,
                Err(error) => {
                    tracing::error!("{:#}", &error);
                    self.record(&format!("cp batch-failed {} {:#}", descriptor.display(), &error))
                        .await;
                    summary.batches_failed += 1;
                }
            }
        }
        quit_wg.add(self.settings.num_workers);
        for _ in 0..self.settings.num_workers {
            request_tx
                .send(Request::Quit)
                .await
                .context("request channel closed before all workers were stopped")?;
        }
        quit_wg.wait().await;
        request_tx.close();
        pool.join().await?;
        tracing::info!("copy finished: {:?}", &summary);
        Ok(summary)
    }

    /// Copies one batch; the descriptor is moved to `done` only on success.
    #[instrument(skip(self, requests))]
    async fn process_batch(
        &self,
        requests: &async_channel::Sender<Request>,
        descriptor: &std::path::Path,
    ) -> anyhow::Result<Summary> {
        let file_name = descriptor
            .file_name()
            .ok_or_else(|| anyhow!("batch descriptor {descriptor:?} has no file name"))?;
        let batch_id = file_name
            .to_str()
            .and_then(project::batch_id_from_file_name)
            .ok_or_else(|| anyhow!("cannot extract a batch number from {descriptor:?}"))?;
        let reader = tokio::fs::File::open(descriptor)
            .await
            .with_context(|| format!("cannot open batch {descriptor:?}"))?;
        let log_path = self.copy_log_dir.join(project::copy_log_file_name(batch_id));
        let mut log = tokio::io::BufWriter::new(
            tokio::fs::File::create(&log_path)
                .await
                .with_context(|| format!("cannot create copy log {log_path:?}"))?,
        );
        log.write_all(format!("{}\n", backup::CSV_HEADER).as_bytes())
            .await
            .with_context(|| format!("failed writing copy log {log_path:?}"))?;
        log.flush()
            .await
            .with_context(|| format!("failed writing copy log {log_path:?}"))?;
        let (response_tx, response_rx) = async_channel::bounded(self.settings.queue_len);
        let outstanding = WaitGroup::new();
        let consumer = tokio::spawn(consume_responses(
            response_rx,
            outstanding.clone(),
            log,
            log_path,
        ));
        let enqueued = self
            .enqueue_batch(requests, reader, batch_id, &response_tx, &outstanding)
            .await;
        outstanding.wait().await;
        response_tx.close();
        let mut summary = consumer
            .await
            .with_context(|| format!("copy log writer of batch {batch_id} failed"))?;
        let enqueued = enqueued.with_context(|| format!("failed processing batch {descriptor:?}"))?;
        tracing::info!("batch {} copied {} files", batch_id, enqueued);
        let done = self.batches.done().join(file_name);
        tokio::fs::rename(descriptor, &done)
            .await
            .with_context(|| format!("failed moving batch {descriptor:?} to {done:?}"))?;
        self.record(&format!("cp batch-done {}", done.display())).await;
        summary.batches_done = 1;
        Ok(summary)
    }

    async fn enqueue_batch(
        &self,
        requests: &async_channel::Sender<Request>,
        reader: tokio::fs::File,
        batch_id: u64,
        response_tx: &async_channel::Sender<BackupFileResponse>,
        outstanding: &WaitGroup,
    ) -> anyhow::Result<u64> {
        let mut segments = tokio::io::BufReader::new(reader).split(b'\n');
        let mut file_id = 0;
        while let Some(line) = segments.next_segment().await? {
            let Some(source) = lines::path_from_line(line) else {
                continue;
            };
            let target = backup::target_path(&self.src_root, &self.target_root, &source);
            let request = BackupFileRequest::new(
                file_id,
                batch_id,
                source,
                target.as_ref().cloned().unwrap_or_default(),
                response_tx.clone(),
            );
            file_id += 1;
            outstanding.add(1);
            let sent = match target {
                Ok(_) => requests.send(Request::Copy(request)).await.is_ok(),
                Err(error) => {
                    // reported straight to the copy log, no worker involved
                    tracing::error!("{:#}", &error);
                    response_tx.send(request.refuse(&error)).await.is_ok()
                }
            };
            if !sent {
                outstanding.done();
                return Err(anyhow!("request channel closed"));
            }
        }
        Ok(file_id)
    }
}

#[cfg(test)]
mod tests {
    use crate::testutils;
    use tracing_test::traced_test;

    use super::*;

    fn settings(num_workers: usize) -> Settings {
        Settings {
            num_workers,
            queue_len: 2,
            open_files: throttle::OpenFiles::new(Some(4)),
        }
    }

    async fn batches_with(
        dir: &std::path::Path,
        contents: &[(&str, Vec<std::path::PathBuf>)],
    ) -> anyhow::Result<BatchesDir> {
        let batches = BatchesDir::new(dir.join("batches"));
        batches.create().await?;
        for (name, paths) in contents {
            testutils::write_list(&batches.todo().join(name), paths).await?;
        }
        Ok(batches)
    }

    #[tokio::test]
    #[traced_test]
    async fn batches_move_to_done_with_logs() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let src = tmp_dir.path().join("foo");
        let dst = tmp_dir.path().join("dst");
        let batches = batches_with(
            tmp_dir.path(),
            &[
                ("1.log", vec![src.join("0.txt"), src.join("bar/1.txt")]),
                ("2.log", vec![src.join("bar/2.txt"), src.join("missing.txt")]),
            ],
        )
        .await?;
        let copy_log_dir = tmp_dir.path().join("copy_log");
        let oplog = OpLog::new(tmp_dir.path().join("oplog.log"));
        let summary = Scheduler::new(&src, &dst, batches.clone(), &copy_log_dir, settings(3))
            .with_oplog(oplog.clone())
            .run()
            .await?;
        assert_eq!(summary.batches_done, 2);
        assert_eq!(summary.batches_failed, 0);
        assert_eq!(summary.files_copied, 3);
        assert_eq!(summary.files_failed, 1);
        assert_eq!(summary.bytes_copied, 3);
        assert!(batches.pending().await?.is_empty());
        assert_eq!(
            batches.completed().await?,
            vec![batches.done().join("1.log"), batches.done().join("2.log")]
        );
        assert_eq!(tokio::fs::read_to_string(dst.join("bar/1.txt")).await?, "1");
        let log = tokio::fs::read_to_string(copy_log_dir.join("copy_batch_2.log")).await?;
        let mut lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.remove(0), backup::CSV_HEADER);
        lines.sort();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("false,"));
        assert!(lines[0].contains(&src.join("missing.txt").display().to_string()));
        assert!(lines[1].starts_with("true,"));
        assert!(lines[1].ends_with(",success"));
        let oplog = tokio::fs::read_to_string(oplog.path()).await?;
        assert_eq!(oplog.lines().filter(|l| l.starts_with("cp batch-done")).count(), 2);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn rerun_only_processes_pending_batches() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let src = tmp_dir.path().join("foo");
        let dst = tmp_dir.path().join("dst");
        let batches = batches_with(tmp_dir.path(), &[("1.log", vec![src.join("0.txt")])]).await?;
        testutils::write_list(&batches.done().join("2.log"), &[src.join("bar/1.txt")]).await?;
        let copy_log_dir = tmp_dir.path().join("copy_log");
        let summary = Scheduler::new(&src, &dst, batches.clone(), &copy_log_dir, settings(1))
            .run()
            .await?;
        assert_eq!(summary.batches_done, 1);
        assert!(dst.join("0.txt").exists());
        assert!(!dst.join("bar/1.txt").exists());
        assert!(!copy_log_dir.join("copy_batch_2.log").exists());
        let again = Scheduler::new(&src, &dst, batches, &copy_log_dir, settings(1))
            .run()
            .await?;
        assert_eq!(again.batches_done, 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn unreadable_batch_is_reported_and_others_continue() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let src = tmp_dir.path().join("foo");
        let dst = tmp_dir.path().join("dst");
        let batches = batches_with(
            tmp_dir.path(),
            &[
                ("1.log", vec![src.join("0.txt")]),
                ("3.log", vec![src.join("baz/4.txt")]),
            ],
        )
        .await?;
        // a descriptor without a batch number cannot be scheduled
        testutils::write_list(&batches.todo().join("extra.log"), &[src.join("bar/2.txt")]).await?;
        let summary = Scheduler::new(
            &src,
            &dst,
            batches.clone(),
            &tmp_dir.path().join("copy_log"),
            settings(2),
        )
        .run()
        .await?;
        assert_eq!(summary.batches_done, 2);
        assert_eq!(summary.batches_failed, 1);
        assert_eq!(
            batches.pending().await?,
            vec![batches.todo().join("extra.log")]
        );
        assert!(dst.join("baz/4.txt").exists());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn more_workers_than_files() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let src = tmp_dir.path().join("foo");
        let dst = tmp_dir.path().join("dst");
        let batches = batches_with(tmp_dir.path(), &[("1.log", vec![]), ("2.log", vec![src.join("0.txt")])]).await?;
        let summary = Scheduler::new(&src, &dst, batches, &tmp_dir.path().join("log"), settings(50))
            .run()
            .await?;
        assert_eq!(summary.batches_done, 2);
        assert_eq!(summary.files_copied, 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn sources_outside_root_fail_without_copying() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let src = tmp_dir.path().join("foo");
        let dst = tmp_dir.path().join("dst");
        let outside = tmp_dir.path().join("secret.txt");
        tokio::fs::write(&outside, "secret").await?;
        let batches = batches_with(
            tmp_dir.path(),
            &[("1.log", vec![src.join("0.txt"), outside.clone()])],
        )
        .await?;
        let copy_log_dir = tmp_dir.path().join("copy_log");
        let summary = Scheduler::new(&src, &dst, batches.clone(), &copy_log_dir, settings(2))
            .run()
            .await?;
        assert_eq!(summary.batches_done, 1);
        assert_eq!(summary.files_copied, 1);
        assert_eq!(summary.files_failed, 1);
        assert!(dst.join("0.txt").exists());
        let mut copied = vec![];
        let mut stack = vec![dst.clone()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    copied.push(path);
                }
            }
        }
        assert_eq!(copied, vec![dst.join("0.txt")]);
        let log = tokio::fs::read_to_string(copy_log_dir.join("copy_batch_1.log")).await?;
        assert!(log.lines().any(|line| {
            line.starts_with("false,")
                && line.contains(&outside.display().to_string())
                && line.contains("outside the source root")
        }));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn rejects_zero_workers() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let batches = batches_with(tmp_dir.path(), &[]).await?;
        let result = Scheduler::new(
            tmp_dir.path(),
            tmp_dir.path(),
            batches,
            &tmp_dir.path().join("log"),
            settings(0),
        )
        .run()
        .await;
        assert!(result.is_err());
        Ok(())
    }
}
