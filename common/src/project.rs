//! Project directory layout.
//!
//! A project is the persistent state of one backup job:
//!
//! ```text
//! rb_<ts>/
//!   list/list_dirs_<ts>.log, list_files_<ts>.log, list_errors_<ts>.log
//!   dirs/skeleton_dirs_<ts>.log, skeleton_errors_<ts>.log
//!   slice/batches_<ts>/{todo,done}/<padded-id>.log
//!   slice/errors_<ts>/slice_errors_<ts>.log
//!   file_copy_<ts>/copy_log/copy_batch_<id>.log
//!   oplog.log
//! ```
//!
//! The `todo` and `done` directories form the work queue: a batch descriptor is pending while it
//! sits in `todo` and complete once renamed into `done`. Both must stay on the same volume so the
//! rename is atomic.

use anyhow::{Context, anyhow};

pub const LIST_DIR: &str = "list";
pub const DIRS_DIR: &str = "dirs";
pub const SLICE_DIR: &str = "slice";
pub const TODO_DIR: &str = "todo";
pub const DONE_DIR: &str = "done";
pub const OPLOG_FILE: &str = "oplog.log";

static PROJECT_ROOT_RE: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
    regex::Regex::new(r"^rb_[0-9]{8}T[0-9]{6}$").expect("project root pattern is valid")
});
static DIGITS_RE: std::sync::LazyLock<regex::Regex> =
    std::sync::LazyLock::new(|| regex::Regex::new(r"[0-9]+").expect("digits pattern is valid"));

/// Returns true for directories named like `rb_20240131T235959`.
#[must_use]
pub fn is_project_root(path: &std::path::Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| PROJECT_ROOT_RE.is_match(name))
}

#[must_use]
pub fn batch_file_name(batch_id: u64, width: usize) -> String {
    format!("{batch_id:0width$}.log")
}

/// Extracts the batch number from a descriptor name such as `0042.log`.
#[must_use]
pub fn batch_id_from_file_name(name: &str) -> Option<u64> {
    DIGITS_RE
        .find(name)
        .and_then(|digits| digits.as_str().parse().ok())
}

#[must_use]
pub fn copy_log_file_name(batch_id: u64) -> String {
    format!("copy_batch_{batch_id}.log")
}

/// Output files of one listing run.
#[derive(Debug, Clone)]
pub struct ListFiles {
    pub dirs: std::path::PathBuf,
    pub files: std::path::PathBuf,
    pub errors: std::path::PathBuf,
}

/// Output files of one skeleton build.
#[derive(Debug, Clone)]
pub struct SkeletonFiles {
    pub dirs: std::path::PathBuf,
    pub errors: std::path::PathBuf,
}

#[derive(Debug, Clone)]
pub struct Project {
    root: std::path::PathBuf,
}

impl Project {
    /// Opens an existing project, creating any missing sub-directory.
    pub async fn open(root: &std::path::Path) -> anyhow::Result<Self> {
        let metadata = tokio::fs::metadata(root)
            .await
            .with_context(|| format!("project directory {root:?} is not accessible"))?;
        if !metadata.is_dir() {
            return Err(anyhow!("project path {root:?} is not a directory"));
        }
        let root = std::path::absolute(root)
            .with_context(|| format!("failed to make {root:?} absolute"))?;
        let project = Self { root };
        project.create_layout().await?;
        Ok(project)
    }

    /// Creates `rb_<stamp>` under `parent`, or reuses `parent` if it already is a project root.
    pub async fn init(parent: &std::path::Path, stamp: &str) -> anyhow::Result<Self> {
        if is_project_root(parent) {
            tracing::info!("reusing project directory {:?}", parent);
            return Self::open(parent).await;
        }
        let root = parent.join(format!("rb_{stamp}"));
        tokio::fs::create_dir(&root)
            .await
            .with_context(|| format!("failed to create project directory {root:?}"))?;
        Self::open(&root).await
    }

    async fn create_layout(&self) -> anyhow::Result<()> {
        for sub_dir in [LIST_DIR, DIRS_DIR, SLICE_DIR] {
            let path = self.root.join(sub_dir);
            tokio::fs::create_dir_all(&path)
                .await
                .with_context(|| format!("failed to create directory {path:?}"))?;
        }
        Ok(())
    }

    #[must_use]
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    #[must_use]
    pub fn oplog_path(&self) -> std::path::PathBuf {
        self.root.join(OPLOG_FILE)
    }

    #[must_use]
    pub fn list_files(&self, stamp: &str) -> ListFiles {
        let dir = self.root.join(LIST_DIR);
        ListFiles {
            dirs: dir.join(format!("list_dirs_{stamp}.log")),
            files: dir.join(format!("list_files_{stamp}.log")),
            errors: dir.join(format!("list_errors_{stamp}.log")),
        }
    }

    #[must_use]
    pub fn skeleton_files(&self, stamp: &str) -> SkeletonFiles {
        let dir = self.root.join(DIRS_DIR);
        SkeletonFiles {
            dirs: dir.join(format!("skeleton_dirs_{stamp}.log")),
            errors: dir.join(format!("skeleton_errors_{stamp}.log")),
        }
    }

    #[must_use]
    pub fn batches_dir(&self, stamp: &str) -> BatchesDir {
        BatchesDir::new(self.root.join(SLICE_DIR).join(format!("batches_{stamp}")))
    }

    #[must_use]
    pub fn slice_errors_file(&self, stamp: &str) -> std::path::PathBuf {
        self.root
            .join(SLICE_DIR)
            .join(format!("errors_{stamp}"))
            .join(format!("slice_errors_{stamp}.log"))
    }

    #[must_use]
    pub fn copy_log_dir(&self, stamp: &str) -> std::path::PathBuf {
        self.root.join(format!("file_copy_{stamp}")).join("copy_log")
    }
}

/// A `batches_<ts>` directory holding the `todo` and `done` queues.
#[derive(Debug, Clone)]
pub struct BatchesDir {
    root: std::path::PathBuf,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct CleanSummary {
    pub removed: usize,
    pub failed: usize,
}

impl std::fmt::Display for CleanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "leftover batches removed: {}\n\
            leftover batches failed: {}",
            self.removed, self.failed,
        )
    }
}

impl BatchesDir {
    #[must_use]
    pub fn new(root: std::path::PathBuf) -> Self {
        Self { root }
    }

    /// Opens an existing batches directory; both queues must already exist.
    pub async fn open(root: &std::path::Path) -> anyhow::Result<Self> {
        let batches = Self::new(root.to_path_buf());
        for dir in [batches.todo(), batches.done()] {
            let metadata = tokio::fs::metadata(&dir)
                .await
                .with_context(|| format!("batches queue {dir:?} is not accessible"))?;
            if !metadata.is_dir() {
                return Err(anyhow!("batches queue {dir:?} is not a directory"));
            }
        }
        Ok(batches)
    }

    pub async fn create(&self) -> anyhow::Result<()> {
        for dir in [self.todo(), self.done()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("failed to create batches queue {dir:?}"))?;
        }
        Ok(())
    }

    #[must_use]
    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    #[must_use]
    pub fn todo(&self) -> std::path::PathBuf {
        self.root.join(TODO_DIR)
    }

    #[must_use]
    pub fn done(&self) -> std::path::PathBuf {
        self.root.join(DONE_DIR)
    }

    /// Regular files in `dir`, sorted by file name.
    async fn descriptors(dir: &std::path::Path) -> anyhow::Result<Vec<std::path::PathBuf>> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("cannot open directory {dir:?} for reading"))?;
        let mut descriptors = vec![];
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed traversing directory {dir:?}"))?
        {
            let file_type = entry
                .file_type()
                .await
                .with_context(|| format!("failed reading file type of {:?}", entry.path()))?;
            if file_type.is_file() {
                descriptors.push(entry.path());
            }
        }
        descriptors.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(descriptors)
    }

    /// Pending batch descriptors in submission order.
    pub async fn pending(&self) -> anyhow::Result<Vec<std::path::PathBuf>> {
        Self::descriptors(&self.todo()).await
    }

    pub async fn completed(&self) -> anyhow::Result<Vec<std::path::PathBuf>> {
        Self::descriptors(&self.done()).await
    }

    /// Removes `todo` descriptors that also exist in `done`.
    ///
    /// A move that was not atomic (e.g. copy + delete on filesystems without rename) can leave a
    /// batch in both queues after a crash; the `done` copy is authoritative.
    #[tracing::instrument]
    pub async fn clean(&self) -> anyhow::Result<CleanSummary> {
        let mut summary = CleanSummary::default();
        let todo = self.todo();
        for done in self.completed().await? {
            let Some(name) = done.file_name() else {
                continue;
            };
            let leftover = todo.join(name);
            match tokio::fs::remove_file(&leftover).await {
                Ok(()) => {
                    tracing::info!("removed leftover batch {:?}", &leftover);
                    summary.removed += 1;
                }
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => {
                    tracing::error!("failed removing leftover batch {:?}: {}", &leftover, error);
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }
}
