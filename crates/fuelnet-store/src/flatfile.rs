//! # Flat File Helpers
//!
//! Small line-oriented text files are the on-disk format of the tank, the
//! pump and the company. Two rules hold for all of them:
//!
//! - A rewrite goes to `<file>.tmp` first and is renamed over the original,
//!   so a crash mid-write leaves either the old or the new content.
//! - A missing file reads as empty.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{StoreError, StoreResult};

/// Lines read back from a file, minus the ones that were not UTF-8.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedLines {
    pub lines: Vec<String>,
    /// Non-blank lines dropped because they were not valid UTF-8.
    pub undecodable: usize,
}

/// Reads every non-blank line, trimmed. A missing file yields no lines.
///
/// A line that is not valid UTF-8 is dropped; see [`read_decoded_lines`].
pub fn read_lines(path: &Path) -> StoreResult<Vec<String>> {
    Ok(read_decoded_lines(path)?.lines)
}

/// Like [`read_lines`], but also counts the lines that were dropped because
/// they did not decode.
pub fn read_decoded_lines(path: &Path) -> StoreResult<DecodedLines> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(DecodedLines::default()),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    let mut decoded = DecodedLines::default();
    for raw in bytes.split(|b| *b == b'\n') {
        match std::str::from_utf8(raw) {
            Ok(line) => {
                let line = line.trim();
                if !line.is_empty() {
                    decoded.lines.push(line.to_string());
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Dropping line that is not UTF-8");
                decoded.undecodable += 1;
            }
        }
    }
    Ok(decoded)
}

/// Replaces the whole file with `lines`, one per line.
pub fn write_lines_atomic<I, S>(path: &Path, lines: I) -> StoreResult<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    ensure_parent(path)?;

    let mut content = String::new();
    for line in lines {
        content.push_str(line.as_ref());
        content.push('\n');
    }

    let tmp = temp_path(path);
    {
        let mut file = fs::File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
        file.write_all(content.as_bytes())
            .map_err(|e| StoreError::io(&tmp, e))?;
        file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))
}

/// Appends one line and flushes it to disk.
pub fn append_line(path: &Path, line: &str) -> StoreResult<()> {
    ensure_parent(path)?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StoreError::io(path, e))?;
    writeln!(file, "{}", line).map_err(|e| StoreError::io(path, e))?;
    file.sync_data().map_err(|e| StoreError::io(path, e))
}

/// Removes a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> StoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

fn ensure_parent(path: &Path) -> StoreResult<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))
        }
        _ => Ok(()),
    }
}

/// `<path>.<suffix>` next to the original file.
pub(crate) fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn temp_path(path: &Path) -> PathBuf {
    sibling(path, "tmp")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_lines(&dir.path().join("nope.txt")).unwrap().is_empty());
    }

    #[test]
    fn test_write_then_read_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.txt");

        write_lines_atomic(&path, ["a,1", "", "  b,2  "]).unwrap();
        assert_eq!(read_lines(&path).unwrap(), vec!["a,1", "b,2"]);
        assert!(!sibling(&path, "tmp").exists());
    }

    #[test]
    fn test_invalid_utf8_line_is_dropped_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.log");
        fs::write(&path, b"first\r\nbad \xff\xfe line\n\nlast\n").unwrap();

        let decoded = read_decoded_lines(&path).unwrap();
        assert_eq!(decoded.lines, vec!["first".to_string(), "last".to_string()]);
        assert_eq!(decoded.undecodable, 1);
        assert_eq!(read_lines(&path).unwrap(), decoded.lines);
    }

    #[test]
    fn test_append_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.log");

        append_line(&path, "one").unwrap();
        append_line(&path, "two").unwrap();
        assert_eq!(read_lines(&path).unwrap(), vec!["one", "two"]);

        remove_if_exists(&path).unwrap();
        remove_if_exists(&path).unwrap();
        assert!(!path.exists());
    }
}
