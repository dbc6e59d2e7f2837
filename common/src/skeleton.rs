//! Directory skeleton.
//!
//! Turns the directory listing into the minimal set of `create_dir_all` calls that recreates the
//! source tree under the target root. Missing source directories are handled according to the
//! [`ValidationMode`].

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::instrument;

use crate::lines;

#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    clap::ValueEnum,
    serde::Deserialize,
    serde::Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Do not check that listed directories still exist
    None,
    /// Record missing directories but create them on the target anyway
    #[default]
    Report,
    /// Record missing directories, skip them and fail the build
    Block,
}

impl std::fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            ValidationMode::None => "none",
            ValidationMode::Report => "report",
            ValidationMode::Block => "block",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for ValidationMode {
    type Err = String;
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "none" => Ok(ValidationMode::None),
            "report" => Ok(ValidationMode::Report),
            "block" => Ok(ValidationMode::Block),
            other => Err(format!(
                "unknown validation mode {other:?}, expected one of: none, report, block"
            )),
        }
    }
}

/// Source directories that were listed but no longer exist (or are no longer directories).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("missed directories: {missed_dir_paths:?}")]
pub struct DirSkeletonError {
    pub missed_dir_paths: Vec<std::path::PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum SkeletonError {
    #[error(transparent)]
    Missed(#[from] DirSkeletonError),
    #[error("failed to create directory {path:?}: {source}")]
    Create {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("directory {path:?} is not under the source root {src_root:?}")]
    OutsideRoot {
        path: std::path::PathBuf,
        src_root: std::path::PathBuf,
    },
}

/// Reduces `paths` to the leaves of the tree they describe.
///
/// Paths are ordered component-wise in descending order so every directory comes right after its
/// deepest descendants; a path is dropped when it is an ancestor of (or equal to) the last kept
/// path. The result is in descending order.
#[must_use]
pub fn short_list(paths: &[std::path::PathBuf]) -> Vec<std::path::PathBuf> {
    let mut sorted: Vec<&std::path::PathBuf> = paths.iter().collect();
    sorted.sort_by(|a, b| b.cmp(a));
    let mut kept: Vec<std::path::PathBuf> = vec![];
    for path in sorted {
        if kept.last().is_some_and(|last| last.starts_with(path)) {
            continue;
        }
        kept.push(path.clone());
    }
    kept
}

#[derive(Copy, Clone, Debug, Default)]
pub struct Summary {
    pub directories_listed: usize,
    pub directories_created: usize,
    pub directories_missed: usize,
    pub errors: usize,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            directories_listed: self.directories_listed + other.directories_listed,
            directories_created: self.directories_created + other.directories_created,
            directories_missed: self.directories_missed + other.directories_missed,
            errors: self.errors + other.errors,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "directories listed: {}\n\
            directories created: {}\n\
            directories missed: {}\n\
            skeleton errors: {}",
            self.directories_listed,
            self.directories_created,
            self.directories_missed,
            self.errors,
        )
    }
}

#[derive(Debug)]
pub struct Outcome {
    /// Created target directories, ascending.
    pub created: Vec<std::path::PathBuf>,
    pub errors: Vec<SkeletonError>,
    pub mode: ValidationMode,
    pub listed: usize,
}

impl Outcome {
    /// True when missing source directories must fail the build.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.mode == ValidationMode::Block
            && self
                .errors
                .iter()
                .any(|error| matches!(error, SkeletonError::Missed(_)))
    }

    #[must_use]
    pub fn missed(&self) -> usize {
        self.errors
            .iter()
            .map(|error| match error {
                SkeletonError::Missed(missed) => missed.missed_dir_paths.len(),
                _ => 0,
            })
            .sum()
    }

    #[must_use]
    pub fn summary(&self) -> Summary {
        Summary {
            directories_listed: self.listed,
            directories_created: self.created.len(),
            directories_missed: self.missed(),
            errors: self.errors.len(),
        }
    }

    pub async fn write_created<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> std::io::Result<()> {
        for path in &self.created {
            lines::write_path(writer, path).await?;
        }
        writer.flush().await
    }

    pub async fn write_errors<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> std::io::Result<()> {
        for error in &self.errors {
            match error {
                SkeletonError::Missed(missed) => {
                    for path in &missed.missed_dir_paths {
                        let line =
                            format!("dir-skeleton-error missed-path: {}\n", path.display());
                        writer.write_all(line.as_bytes()).await?;
                    }
                }
                other => {
                    let line = format!("dir-skeleton-error general-error: {other}\n");
                    writer.write_all(line.as_bytes()).await?;
                }
            }
        }
        writer.flush().await
    }
}

#[derive(Debug, Clone)]
pub struct Skeleton {
    src_root: std::path::PathBuf,
    target_root: std::path::PathBuf,
    mode: ValidationMode,
}

impl Skeleton {
    #[must_use]
    pub fn new(
        src_root: &std::path::Path,
        target_root: &std::path::Path,
        mode: ValidationMode,
    ) -> Self {
        Self {
            src_root: src_root.to_path_buf(),
            target_root: target_root.to_path_buf(),
            mode,
        }
    }

    async fn is_dir(path: &std::path::Path) -> bool {
        tokio::fs::metadata(path)
            .await
            .is_ok_and(|metadata| metadata.is_dir())
    }

    fn target_path(&self, path: &std::path::Path) -> Result<std::path::PathBuf, SkeletonError> {
        match path.strip_prefix(&self.src_root) {
            Ok(relative) if relative.as_os_str().is_empty() => Ok(self.target_root.clone()),
            Ok(relative) => Ok(self.target_root.join(relative)),
            Err(_) => Err(SkeletonError::OutsideRoot {
                path: path.to_path_buf(),
                src_root: self.src_root.clone(),
            }),
        }
    }

    /// Reads the directory list and creates the short list under the target root.
    ///
    /// Only a failure to read `dir_list` is returned as an error; everything else is collected in
    /// the [`Outcome`].
    #[instrument(skip(dir_list))]
    pub async fn build<R: AsyncRead + Unpin>(&self, dir_list: R) -> anyhow::Result<Outcome> {
        let mut listed = lines::read_paths(dir_list)
            .await
            .context("failed reading directory list")?;
        listed.sort();
        listed.dedup();
        let mut errors = vec![];
        let mut missed = vec![];
        if self.mode != ValidationMode::None {
            for path in &listed {
                if !Self::is_dir(path).await {
                    tracing::debug!("source directory {:?} is missing", path);
                    missed.push(path.clone());
                }
            }
        }
        let to_create: Vec<std::path::PathBuf> = if self.mode == ValidationMode::Block {
            listed
                .iter()
                .filter(|path| missed.binary_search(*path).is_err())
                .cloned()
                .collect()
        } else {
            listed.clone()
        };
        if !missed.is_empty() {
            tracing::error!("{} listed directories are missing", missed.len());
            errors.push(SkeletonError::from(DirSkeletonError {
                missed_dir_paths: missed,
            }));
        }
        let mut created = vec![];
        for path in short_list(&to_create) {
            let target = match self.target_path(&path) {
                Ok(target) => target,
                Err(error) => {
                    tracing::error!("{}", &error);
                    errors.push(error);
                    continue;
                }
            };
            match tokio::fs::create_dir_all(&target).await {
                Ok(()) => {
                    tracing::debug!("created {:?}", &target);
                    created.push(target);
                }
                Err(source) => {
                    let error = SkeletonError::Create {
                        path: target,
                        source,
                    };
                    tracing::error!("{}", &error);
                    errors.push(error);
                }
            }
        }
        created.sort();
        Ok(Outcome {
            created,
            errors,
            mode: self.mode,
            listed: listed.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::testutils;
    use proptest::prelude::*;
    use tracing_test::traced_test;

    use super::*;

    fn paths(list: &[&str]) -> Vec<std::path::PathBuf> {
        list.iter().map(std::path::PathBuf::from).collect()
    }

    #[test]
    fn short_list_keeps_leaves_only() {
        assert_eq!(
            short_list(&paths(&["/a", "/a/b", "/a/b/c", "/x"])),
            paths(&["/x", "/a/b/c"])
        );
    }

    #[test]
    fn short_list_compares_components_not_strings() {
        // "/a/b" is not an ancestor of "/a/bc"
        let mut kept = short_list(&paths(&["/a", "/a/b", "/a/bc"]));
        kept.sort();
        assert_eq!(kept, paths(&["/a/b", "/a/bc"]));
    }

    #[test]
    fn short_list_drops_duplicates_and_handles_empty() {
        assert_eq!(short_list(&paths(&["/a", "/a"])), paths(&["/a"]));
        assert!(short_list(&[]).is_empty());
    }

    fn arb_paths() -> impl Strategy<Value = Vec<std::path::PathBuf>> {
        prop::collection::vec(prop::collection::vec("[ab]{1,2}", 1..4), 0..24).prop_map(
            |all| {
                all.into_iter()
                    .map(|components| {
                        std::path::PathBuf::from(format!("/{}", components.join("/")))
                    })
                    .collect()
            },
        )
    }

    proptest! {
        #[test]
        fn short_list_is_minimal_and_complete(input in arb_paths()) {
            let kept = short_list(&input);
            for path in &input {
                prop_assert!(kept.iter().any(|leaf| leaf.starts_with(path)));
            }
            for (i, a) in kept.iter().enumerate() {
                for (j, b) in kept.iter().enumerate() {
                    if i != j {
                        prop_assert!(!a.starts_with(b), "{:?} is under {:?}", a, b);
                    }
                }
                prop_assert!(input.contains(a));
            }
        }
    }

    async fn dir_list(paths: &[std::path::PathBuf]) -> Vec<u8> {
        let mut buf = vec![];
        for path in paths {
            lines::write_path(&mut buf, path).await.unwrap();
        }
        buf
    }

    #[tokio::test]
    #[traced_test]
    async fn recreates_source_tree() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let src = tmp_dir.path().join("foo");
        let dst = tmp_dir.path().join("dst");
        let listed = vec![src.clone(), src.join("bar"), src.join("baz")];
        let input = dir_list(&listed).await;
        let outcome = Skeleton::new(&src, &dst, ValidationMode::Report)
            .build(input.as_slice())
            .await?;
        assert!(outcome.errors.is_empty());
        assert!(!outcome.is_blocked());
        assert_eq!(outcome.created, vec![dst.join("bar"), dst.join("baz")]);
        assert!(dst.join("bar").is_dir());
        assert!(dst.join("baz").is_dir());
        assert_eq!(outcome.summary().directories_listed, 3);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn source_root_maps_to_target_root() -> anyhow::Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let src = tmp_dir.path().join("src");
        tokio::fs::create_dir(&src).await?;
        let dst = tmp_dir.path().join("dst");
        let input = dir_list(std::slice::from_ref(&src)).await;
        let outcome = Skeleton::new(&src, &dst, ValidationMode::Report)
            .build(input.as_slice())
            .await?;
        assert_eq!(outcome.created, vec![dst.clone()]);
        let mut written = vec![];
        outcome.write_created(&mut written).await?;
        assert_eq!(written, format!("{}\n", dst.display()).into_bytes());
        assert!(dst.is_dir());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn building_twice_is_idempotent() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let src = tmp_dir.path().join("foo");
        let dst = tmp_dir.path().join("dst");
        let input = dir_list(&[src.clone(), src.join("bar"), src.join("baz")]).await;
        let skeleton = Skeleton::new(&src, &dst, ValidationMode::Block);
        let first = skeleton.build(input.as_slice()).await?;
        let second = skeleton.build(input.as_slice()).await?;
        assert_eq!(first.created, second.created);
        assert!(second.errors.is_empty());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn report_mode_records_misses_and_still_creates() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let src = tmp_dir.path().join("foo");
        let dst = tmp_dir.path().join("dst");
        let gone = src.join("gone");
        let input = dir_list(&[src.clone(), src.join("bar"), gone.clone()]).await;
        let outcome = Skeleton::new(&src, &dst, ValidationMode::Report)
            .build(input.as_slice())
            .await?;
        assert!(!outcome.is_blocked());
        assert_eq!(outcome.missed(), 1);
        assert!(dst.join("gone").is_dir());
        assert!(dst.join("bar").is_dir());
        let mut out = vec![];
        outcome.write_errors(&mut out).await?;
        assert_eq!(
            String::from_utf8(out)?,
            format!("dir-skeleton-error missed-path: {}\n", gone.display())
        );
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn block_mode_skips_misses_creates_rest_and_fails() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let src = tmp_dir.path().join("foo");
        let dst = tmp_dir.path().join("dst");
        let gone = src.join("bar/gone");
        let input = dir_list(&[src.clone(), src.join("bar"), gone.clone(), src.join("baz")]).await;
        let outcome = Skeleton::new(&src, &dst, ValidationMode::Block)
            .build(input.as_slice())
            .await?;
        assert!(outcome.is_blocked());
        assert!(!dst.join("bar/gone").exists());
        // the parent of the missed directory is now a leaf and still created
        assert_eq!(outcome.created, vec![dst.join("bar"), dst.join("baz")]);
        match &outcome.errors[..] {
            [SkeletonError::Missed(missed)] => {
                assert_eq!(missed.missed_dir_paths, vec![gone.clone()]);
                assert_eq!(
                    missed.to_string(),
                    format!("missed directories: [{gone:?}]")
                );
            }
            other => panic!("unexpected errors: {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn none_mode_ignores_misses() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let src = tmp_dir.path().join("foo");
        let dst = tmp_dir.path().join("dst");
        let input = dir_list(&[src.join("gone")]).await;
        let outcome = Skeleton::new(&src, &dst, ValidationMode::None)
            .build(input.as_slice())
            .await?;
        assert!(outcome.errors.is_empty());
        assert!(dst.join("gone").is_dir());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn paths_outside_source_root_are_errors() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let src = tmp_dir.path().join("foo");
        let dst = tmp_dir.path().join("dst");
        let outside = tmp_dir.path().join("elsewhere");
        let input = dir_list(&[outside.clone(), src.join("bar")]).await;
        let outcome = Skeleton::new(&src, &dst, ValidationMode::None)
            .build(input.as_slice())
            .await?;
        assert_eq!(outcome.created, vec![dst.join("bar")]);
        assert!(matches!(
            &outcome.errors[..],
            [SkeletonError::OutsideRoot { path, .. }] if path == &outside
        ));
        let mut out = vec![];
        outcome.write_errors(&mut out).await?;
        assert!(String::from_utf8(out)?.starts_with("dir-skeleton-error general-error: "));
        Ok(())
    }

    #[test]
    fn validation_mode_parses() {
        assert_eq!("block".parse::<ValidationMode>(), Ok(ValidationMode::Block));
        assert!("strict".parse::<ValidationMode>().is_err());
        assert_eq!(ValidationMode::default().to_string(), "report");
    }
}
