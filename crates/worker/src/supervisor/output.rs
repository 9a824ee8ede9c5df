//! Worker output plumbing: line readers, the per-job log, and the stderr tail.

use std::collections::VecDeque;
use std::io;
use std::path::Path;

use futures::StreamExt;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedRead};

/// Number of stderr lines kept for failure excerpts.
pub const STDERR_TAIL_LINES: usize = 20;

/// Longest line forwarded from a worker, in bytes. Longer lines are cut.
const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// One line of worker output, without its terminator.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: Stream,
    pub text: String,
}

/// Splits worker output on `\n` or `\r`.
///
/// Progress bars redraw in place with a bare `\r`, so each redraw is a
/// frame of its own. The buffer never holds more than `max_len` bytes of
/// one frame: an over-long frame is emitted cut at `max_len` and the rest
/// of it, up to the next terminator, is dropped.
#[derive(Debug)]
pub struct WorkerLineCodec {
    max_len: usize,
    /// Bytes already scanned for a terminator.
    next_index: usize,
    after_cr: bool,
    discarding: bool,
}

impl WorkerLineCodec {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len: max_len.max(1),
            next_index: 0,
            after_cr: false,
            discarding: false,
        }
    }
}

impl Default for WorkerLineCodec {
    fn default() -> Self {
        Self::new(MAX_LINE_BYTES)
    }
}

impl Decoder for WorkerLineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<String>> {
        loop {
            let found = buf[self.next_index..]
                .iter()
                .position(|b| *b == b'\n' || *b == b'\r')
                .map(|offset| self.next_index + offset);

            let Some(pos) = found else {
                if buf.len() <= self.max_len {
                    self.next_index = buf.len();
                    return Ok(None);
                }
                self.next_index = 0;
                self.after_cr = false;
                if self.discarding {
                    buf.clear();
                    return Ok(None);
                }
                self.discarding = true;
                let frame = buf.split_to(self.max_len);
                return Ok(Some(String::from_utf8_lossy(&frame).into_owned()));
            };

            let frame = buf.split_to(pos + 1);
            let terminator = frame[pos];
            let follows_cr = self.after_cr;
            self.next_index = 0;
            self.after_cr = terminator == b'\r';

            if self.discarding {
                self.discarding = false;
                continue;
            }
            // An empty frame is only a line when it is a bare `\n`.
            if pos == 0 && (terminator == b'\r' || follows_cr) {
                continue;
            }
            let end = pos.min(self.max_len);
            return Ok(Some(String::from_utf8_lossy(&frame[..end]).into_owned()));
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<String>> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if buf.is_empty() || self.discarding {
            buf.clear();
            self.discarding = false;
            return Ok(None);
        }
        let frame = buf.split_to(buf.len());
        Ok(Some(String::from_utf8_lossy(&frame).into_owned()))
    }
}

/// Forward lines from `reader` into `tx` until EOF or the receiver closes.
///
/// `send` awaits when the channel is full, so a worker that floods its
/// output is slowed down by pipe backpressure instead of growing memory.
pub fn spawn_reader<R>(reader: R, stream: Stream, tx: mpsc::Sender<OutputLine>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut frames = FramedRead::new(reader, WorkerLineCodec::default());
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(text) => {
                    if tx.send(OutputLine { stream, text }).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(?stream, error = %e, "Worker output stream closed with error");
                    break;
                }
            }
        }
    })
}

/// Append-only per-job log file.
#[derive(Debug)]
pub struct JobLog {
    file: File,
}

impl JobLog {
    /// Open (creating parents) the log at `path` for appending.
    pub async fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        Ok(Self { file })
    }

    /// Append one line and flush it, so a concurrent reader sees it.
    pub async fn append(&mut self, line: &str) -> io::Result<()> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        self.file.write_all(&bytes).await?;
        self.file.flush().await
    }
}

/// Ring buffer of the most recent stderr lines.
#[derive(Debug)]
pub struct StderrTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl StderrTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: &str) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    pub fn excerpt(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

impl Default for StderrTail {
    fn default() -> Self {
        Self::new(STDERR_TAIL_LINES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_most_recent_lines() {
        let mut tail = StderrTail::new(2);
        tail.push("one");
        tail.push("two");
        tail.push("three");
        assert_eq!(tail.excerpt(), "two\nthree");
    }

    #[tokio::test]
    async fn reader_splits_lines_and_strips_terminators() {
        let (tx, mut rx) = mpsc::channel(4);
        let input: &[u8] = b"first\r\nsecond\nno newline";
        spawn_reader(input, Stream::Stdout, tx).await.unwrap();

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line.text);
        }
        assert_eq!(lines, vec!["first", "second", "no newline"]);
    }

    #[tokio::test]
    async fn carriage_return_redraws_are_separate_lines() {
        let (tx, mut rx) = mpsc::channel(8);
        let input: &[u8] = b"\r 10%|#| 1/10\r 20%|##| 2/10\r 30%|###| 3/10\ndone\n\nlast";
        let reader = spawn_reader(input, Stream::Stderr, tx);

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line.text);
        }
        reader.await.unwrap();
        assert_eq!(
            lines,
            vec![" 10%|#| 1/10", " 20%|##| 2/10", " 30%|###| 3/10", "done", "", "last"]
        );
    }

    #[test]
    fn unterminated_line_is_bounded_while_buffering() {
        let mut codec = WorkerLineCodec::new(8);
        let mut buf = BytesMut::from(&b"0123456789abc"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("01234567"));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.len() <= 8);

        buf.extend_from_slice(b"defghijklmnop");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert!(buf.len() <= 8);

        buf.extend_from_slice(b"tail\nnext\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("next"));
        assert!(buf.is_empty());
    }

    #[test]
    fn terminated_line_over_the_limit_is_cut() {
        let mut codec = WorkerLineCodec::new(4);
        let mut buf = BytesMut::from(&b"abc"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"de\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("abcd"));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[tokio::test]
    async fn log_appends_and_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("generation").join("1.log");
        let mut log = JobLog::open(&path).await.unwrap();
        log.append("hello").await.unwrap();
        log.append("world").await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "hello\nworld\n");
    }
}
