/// Builds the tree used by most tests under a fresh temporary directory:
///
/// ```text
/// foo
/// |- 0.txt
/// |- bar
///    |- 1.txt
///    |- 2.txt
///    |- 3.txt
/// |- baz
///    |- 4.txt
///    |- 5.txt -> ../bar/2.txt
///    |- 6.txt -> (absolute path) .../foo/bar/3.txt
/// ```
pub async fn setup_test_dir() -> anyhow::Result<tempfile::TempDir> {
    let tmp_dir = tempfile::tempdir()?;
    let foo_path = tmp_dir.path().join("foo");
    tokio::fs::create_dir(&foo_path).await?;
    tokio::fs::write(foo_path.join("0.txt"), "0").await?;
    let bar_path = foo_path.join("bar");
    tokio::fs::create_dir(&bar_path).await?;
    tokio::fs::write(bar_path.join("1.txt"), "1").await?;
    tokio::fs::write(bar_path.join("2.txt"), "2").await?;
    tokio::fs::write(bar_path.join("3.txt"), "3").await?;
    let baz_path = foo_path.join("baz");
    tokio::fs::create_dir(&baz_path).await?;
    tokio::fs::write(baz_path.join("4.txt"), "4").await?;
    tokio::fs::symlink("../bar/2.txt", baz_path.join("5.txt")).await?;
    tokio::fs::symlink(bar_path.join("3.txt"), baz_path.join("6.txt")).await?;
    Ok(tmp_dir)
}

/// Writes `paths` one per line into `file`.
pub async fn write_list(
    file: &std::path::Path,
    paths: &[std::path::PathBuf],
) -> anyhow::Result<()> {
    let mut buf = vec![];
    for path in paths {
        crate::lines::write_path(&mut buf, path).await?;
    }
    tokio::fs::write(file, buf).await?;
    Ok(())
}
