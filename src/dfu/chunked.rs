//! Chunked transfer engine shared by both protocol generations.

use std::ops::Range;
use std::thread;
use std::time::Duration;

use uuid::Uuid;

use super::error::DfuResult;
use super::link::GattLink;
use super::session::CancelToken;
use super::transport::BleTransport;

/// Streams a buffer as consecutive MTU-sized writes with a fixed pause between them.
#[derive(Debug, Clone, Copy)]
pub struct ChunkedWriter {
    chunk_size: usize,
    pacing: Duration,
}

impl ChunkedWriter {
    pub fn new(chunk_size: usize, pacing: Duration) -> Self {
        debug_assert!(chunk_size > 0, "chunk size must be non-zero");
        Self {
            chunk_size: chunk_size.max(1),
            pacing,
        }
    }

    /// Cap the chunk size at what the transport can carry in one write.
    pub fn limited_to(self, max_write_size: usize) -> Self {
        Self {
            chunk_size: self.chunk_size.min(max_write_size).max(1),
            ..self
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Write `buffer` to `characteristic`, one write per chunk.
    ///
    /// `on_chunk` receives each chunk after the transport accepted it, in
    /// order. Returns the number of bytes written.
    pub fn send<T, F>(
        &self,
        link: &mut GattLink<T>,
        characteristic: Uuid,
        buffer: &[u8],
        cancel: &CancelToken,
        mut on_chunk: F,
    ) -> DfuResult<usize>
    where
        T: BleTransport,
        F: FnMut(&[u8]),
    {
        let ranges = chunk_ranges(buffer.len(), self.chunk_size);
        let count = ranges.len();

        for (index, range) in ranges.into_iter().enumerate() {
            cancel.check()?;

            let chunk = &buffer[range];
            link.write(characteristic, chunk)?;
            tracing::trace!(%characteristic, len = chunk.len(), index, count, "Chunk written");
            on_chunk(chunk);

            if index + 1 < count && !self.pacing.is_zero() {
                thread::sleep(self.pacing);
            }
        }

        Ok(buffer.len())
    }
}

/// Split `len` bytes into consecutive ranges of at most `chunk_size`.
pub fn chunk_ranges(len: usize, chunk_size: usize) -> Vec<Range<usize>> {
    debug_assert!(chunk_size > 0, "chunk size must be non-zero");
    let chunk_size = chunk_size.max(1);
    (0..len)
        .step_by(chunk_size)
        .map(|start| start..(start + chunk_size).min(len))
        .collect()
}

/// Split `len` bytes into object sizes of at most `max_size`.
pub fn object_sizes(len: usize, max_size: usize) -> Vec<usize> {
    chunk_ranges(len, max_size)
        .into_iter()
        .map(|range| range.len())
        .collect()
}
