use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

pub(crate) const DEFAULT_LINE_BUFFER: usize = 1024;
/// Bytes kept per line; the rest of an overlong line is discarded.
pub(crate) const MAX_LINE_BYTES: usize = 64 * 1024;

/// Splits a byte stream into lines through a bounded read buffer.
///
/// Lines longer than the buffer are reassembled before being returned, up to
/// [`MAX_LINE_BYTES`]. A final fragment without a newline is still yielded
/// once at end of stream.
pub(crate) struct LineReader<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
    done: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub(crate) fn new(inner: R, capacity: usize) -> Self {
        Self {
            reader: BufReader::with_capacity(capacity.max(1), inner),
            pending: Vec::new(),
            done: false,
        }
    }

    /// Cancel-safe: a partially read line is kept in `pending` if the future
    /// is dropped, and completed by the next call.
    pub(crate) async fn next_line(&mut self) -> io::Result<Option<String>> {
        if self.done {
            return Ok(None);
        }
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                self.done = true;
                if self.pending.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.take_line()));
            }
            match available.iter().position(|byte| *byte == b'\n') {
                Some(index) => {
                    append_capped(&mut self.pending, &available[..index]);
                    self.reader.consume(index + 1);
                    return Ok(Some(self.take_line()));
                }
                None => {
                    let len = available.len();
                    append_capped(&mut self.pending, available);
                    self.reader.consume(len);
                }
            }
        }
    }

    fn take_line(&mut self) -> String {
        if self.pending.last() == Some(&b'\r') {
            self.pending.pop();
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        line
    }
}

fn append_capped(pending: &mut Vec<u8>, bytes: &[u8]) {
    let room = MAX_LINE_BYTES.saturating_sub(pending.len());
    pending.extend_from_slice(&bytes[..bytes.len().min(room)]);
}
