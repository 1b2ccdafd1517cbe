use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use rand::RngCore;

pub(crate) const FILLER_BLOCK_SIZE: usize = 32 * 1024;

/// Random bytes generated once per process and shared read-only by every
/// download.
#[derive(Clone)]
pub(crate) struct FillerBlock(Bytes);

impl FillerBlock {
    pub(crate) fn random() -> Self {
        let mut block = vec![0u8; FILLER_BLOCK_SIZE];
        rand::thread_rng().fill_bytes(&mut block);
        Self(Bytes::from(block))
    }
}

/// Inclusive byte range within a file of known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ByteRange {
    pub(crate) start: u64,
    pub(crate) end: u64,
}

impl ByteRange {
    pub(crate) fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// A file of `remaining` bytes made by tiling the filler block.
pub(crate) struct SyntheticStream {
    filler: Bytes,
    remaining: u64,
    cursor: usize,
}

impl SyntheticStream {
    pub(crate) fn open(filler: &FillerBlock, total: u64) -> Self {
        Self {
            filler: filler.0.clone(),
            remaining: total,
            cursor: 0,
        }
    }

    /// Serves the sum of the requested spans. The cursor starts at the first
    /// range's offset so a given offset maps to the same filler byte.
    pub(crate) fn open_ranges(filler: &FillerBlock, ranges: &[ByteRange]) -> Self {
        let total = ranges.iter().map(ByteRange::len).sum();
        let cursor = ranges
            .first()
            .map(|range| (range.start % FILLER_BLOCK_SIZE as u64) as usize)
            .unwrap_or(0);
        Self {
            filler: filler.0.clone(),
            remaining: total,
            cursor,
        }
    }

    pub(crate) fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Copies filler into `buf`, returning 0 once the declared size has been
    /// emitted.
    #[cfg(test)]
    pub(crate) fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut written = 0;
        while written < buf.len() {
            let Some(chunk) = self.next_chunk(buf.len() - written) else {
                break;
            };
            buf[written..written + chunk.len()].copy_from_slice(&chunk);
            written += chunk.len();
        }
        written
    }

    fn next_chunk(&mut self, limit: usize) -> Option<Bytes> {
        if self.remaining == 0 || limit == 0 {
            return None;
        }
        let available = self.filler.len() - self.cursor;
        let len = available
            .min(limit)
            .min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let chunk = self.filler.slice(self.cursor..self.cursor + len);
        self.cursor = (self.cursor + len) % self.filler.len();
        self.remaining -= len as u64;
        Some(chunk)
    }
}

impl Stream for SyntheticStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Poll::Ready(this.next_chunk(FILLER_BLOCK_SIZE).map(Ok))
    }
}
