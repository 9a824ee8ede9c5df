//! Incremental reader for the per-job progress file.
//!
//! Workers either append to the file or rewrite it in place. Appends are
//! read from the last consumed offset, so each line is handed out once.
//! A rewrite (the file shrank, or the bytes before the offset changed)
//! yields only the file's last line.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Bytes before the offset compared to tell an append from a rewrite.
const TAIL_BYTES: usize = 256;

#[derive(Debug)]
pub struct ProgressFile {
    path: PathBuf,
    offset: u64,
    tail: Vec<u8>,
}

impl ProgressFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            offset: 0,
            tail: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines written since the previous call. A missing file has none.
    ///
    /// A trailing line without its `\n` is left for the next call.
    pub async fn read_new_lines(&mut self) -> io::Result<Vec<String>> {
        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let len = file.metadata().await?.len();
        if len == self.offset && self.tail.is_empty() {
            return Ok(Vec::new());
        }

        if len >= self.offset {
            let start = self.offset - self.tail.len() as u64;
            file.seek(SeekFrom::Start(start)).await?;
            let mut buf = Vec::new();
            file.read_to_end(&mut buf).await?;
            if buf.starts_with(&self.tail) {
                let appended = buf.split_off(self.tail.len());
                return Ok(self.consume_appended(&appended));
            }
        }

        file.seek(SeekFrom::Start(0)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        self.offset = buf.len() as u64;
        self.tail = last_bytes(&buf, TAIL_BYTES).to_vec();
        Ok(split_lines(&buf).pop().into_iter().collect())
    }

    fn consume_appended(&mut self, appended: &[u8]) -> Vec<String> {
        let Some(last_newline) = appended.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };
        let complete = &appended[..=last_newline];
        self.offset += complete.len() as u64;
        self.tail.extend_from_slice(complete);
        let excess = self.tail.len().saturating_sub(TAIL_BYTES);
        self.tail.drain(..excess);
        split_lines(complete)
    }
}

fn last_bytes(buf: &[u8], n: usize) -> &[u8] {
    &buf[buf.len().saturating_sub(n)..]
}

/// Non-empty lines, lossily decoded.
fn split_lines(buf: &[u8]) -> Vec<String> {
    buf.split(|b| *b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .filter(|line| !line.is_empty())
        .map(|line| String::from_utf8_lossy(line).into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn append(path: &Path, text: &[u8]) {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .unwrap();
        file.write_all(text).await.unwrap();
    }

    #[tokio::test]
    async fn appended_lines_are_read_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut progress = ProgressFile::new(dir.path().join("progress"));
        assert!(progress.read_new_lines().await.unwrap().is_empty());

        append(progress.path(), b"step 1/4\nstep 2/4\n").await;
        assert_eq!(progress.read_new_lines().await.unwrap(), vec!["step 1/4", "step 2/4"]);
        assert!(progress.read_new_lines().await.unwrap().is_empty());

        append(progress.path(), b"step 3/4\nstep 4").await;
        assert_eq!(progress.read_new_lines().await.unwrap(), vec!["step 3/4"]);

        append(progress.path(), b"/4\n").await;
        assert_eq!(progress.read_new_lines().await.unwrap(), vec!["step 4/4"]);
    }

    #[tokio::test]
    async fn rewrite_in_place_yields_the_last_line() {
        let dir = tempfile::tempdir().unwrap();
        let mut progress = ProgressFile::new(dir.path().join("progress"));

        tokio::fs::write(progress.path(), "PROGRESS: 30%\n").await.unwrap();
        assert_eq!(progress.read_new_lines().await.unwrap(), vec!["PROGRESS: 30%"]);

        // Same length, different bytes.
        tokio::fs::write(progress.path(), "PROGRESS: 40%\n").await.unwrap();
        assert_eq!(progress.read_new_lines().await.unwrap(), vec!["PROGRESS: 40%"]);

        tokio::fs::write(progress.path(), "old\nPROGRESS: 5%\n").await.unwrap();
        tokio::fs::write(progress.path(), "9%\n").await.unwrap();
        assert_eq!(progress.read_new_lines().await.unwrap(), vec!["9%"]);
    }

    #[tokio::test]
    async fn invalid_utf8_is_decoded_lossily() {
        let dir = tempfile::tempdir().unwrap();
        let mut progress = ProgressFile::new(dir.path().join("progress"));
        append(progress.path(), b"step \xff 2/4\n").await;
        assert_eq!(progress.read_new_lines().await.unwrap(), vec!["step \u{fffd} 2/4"]);
    }
}
