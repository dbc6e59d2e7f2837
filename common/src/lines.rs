//! Line-oriented path lists.
//!
//! Every list the tool persists (listing outputs, batch descriptors, skeleton output) holds one
//! path per line. Paths are written as raw bytes so that non UTF-8 file names survive the round
//! trip through the project directory.

use std::os::unix::ffi::{OsStrExt, OsStringExt};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt};

/// Converts one line (without the trailing newline) into a path; blank lines yield `None`.
#[must_use]
pub fn path_from_line(line: Vec<u8>) -> Option<std::path::PathBuf> {
    if line.is_empty() {
        return None;
    }
    Some(std::path::PathBuf::from(std::ffi::OsString::from_vec(line)))
}

pub async fn write_path<W: AsyncWrite + Unpin>(
    writer: &mut W,
    path: &std::path::Path,
) -> std::io::Result<()> {
    writer.write_all(path.as_os_str().as_bytes()).await?;
    writer.write_all(b"\n").await
}

/// Reads every non-blank line of `reader` as a path.
pub async fn read_paths<R: AsyncRead + Unpin>(
    reader: R,
) -> std::io::Result<Vec<std::path::PathBuf>> {
    let mut segments = tokio::io::BufReader::new(reader).split(b'\n');
    let mut paths = vec![];
    while let Some(line) = segments.next_segment().await? {
        if let Some(path) = path_from_line(line) {
            paths.push(path);
        }
    }
    Ok(paths)
}

/// Counts the non-blank lines of `reader`.
pub async fn count_paths<R: AsyncRead + Unpin>(reader: R) -> std::io::Result<u64> {
    let mut segments = tokio::io::BufReader::new(reader).split(b'\n');
    let mut count = 0;
    while let Some(line) = segments.next_segment().await? {
        if path_from_line(line).is_some() {
            count += 1;
        }
    }
    Ok(count)
}
