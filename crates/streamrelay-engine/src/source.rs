//! Chunk sources: finite, non-restartable producers of payload bytes.
//!
//! A source answers `next_chunk` with one of three outcomes:
//! - `Ok(Some(chunk))` -- more payload (an empty chunk also ends the stream)
//! - `Ok(None)` -- end of stream
//! - `Err(_)` -- the producer failed; this is never folded into end of stream
//!
//! Once a source has ended or failed it keeps answering `Ok(None)`.

use std::io::{self, Read};

use tokio::sync::mpsc;

/// Failure of the payload producer.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Source read failed: {0}")]
    Io(#[from] io::Error),

    #[error("Upstream failed: {0}")]
    Upstream(String),
}

/// Producer of payload chunks for the relay.
pub trait ChunkSource {
    /// Produce the next chunk. Called only when the child's stdin is writable
    /// and no earlier chunk is still waiting to be written.
    fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, SourceError>;
}

impl<S: ChunkSource + ?Sized> ChunkSource for &mut S {
    fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, SourceError> {
        (**self).next_chunk()
    }
}

impl<S: ChunkSource + ?Sized> ChunkSource for Box<S> {
    fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, SourceError> {
        (**self).next_chunk()
    }
}

/// Source reading fixed-size chunks from any [`Read`].
#[derive(Debug)]
pub struct ReaderSource<R> {
    reader: R,
    chunk_size: usize,
    done: bool,
}

impl<R: Read> ReaderSource<R> {
    /// Read `reader` in chunks of at most `chunk_size` bytes.
    ///
    /// A zero `chunk_size` is bumped to one byte.
    pub fn new(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            chunk_size: chunk_size.max(1),
            done: false,
        }
    }
}

impl<R: Read> ChunkSource for ReaderSource<R> {
    fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, SourceError> {
        if self.done {
            return Ok(None);
        }
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => {
                    self.done = true;
                    return Ok(None);
                }
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(Some(buf));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.done = true;
                    return Err(e.into());
                }
            }
        }
    }
}

/// Source over an iterator of ready-made chunks.
#[derive(Debug)]
pub struct IterSource<I> {
    chunks: I,
    done: bool,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = Vec<u8>>,
{
    pub const fn new(chunks: I) -> Self {
        Self {
            chunks,
            done: false,
        }
    }
}

impl IterSource<std::vec::IntoIter<Vec<u8>>> {
    /// Convenience constructor from anything byte-like.
    pub fn from_chunks<C, B>(chunks: C) -> Self
    where
        C: IntoIterator<Item = B>,
        B: Into<Vec<u8>>,
    {
        let chunks: Vec<Vec<u8>> = chunks.into_iter().map(Into::into).collect();
        Self::new(chunks.into_iter())
    }
}

impl<I> ChunkSource for IterSource<I>
where
    I: Iterator<Item = Vec<u8>>,
{
    fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, SourceError> {
        if self.done {
            return Ok(None);
        }
        let next = self.chunks.next();
        if next.as_ref().is_none_or(Vec::is_empty) {
            self.done = true;
        }
        Ok(next)
    }
}

/// Item sent into a [`ChannelSource`].
pub type ChannelItem = Result<Vec<u8>, SourceError>;

/// Source fed by an async producer over a bounded channel.
///
/// The producer sends `Ok(chunk)` for payload and `Err(_)` on failure.
/// Dropping every sender ends the stream. `next_chunk` blocks the calling
/// thread, so the relay must run off the async runtime (see
/// [`StreamRelay::relay_async`](crate::relay::StreamRelay::relay_async)).
#[derive(Debug)]
pub struct ChannelSource {
    rx: mpsc::Receiver<ChannelItem>,
    done: bool,
}

impl ChannelSource {
    /// Create a source and the sender that feeds it.
    pub fn channel(capacity: usize) -> (mpsc::Sender<ChannelItem>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx, done: false })
    }
}

impl ChunkSource for ChannelSource {
    fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, SourceError> {
        if self.done {
            return Ok(None);
        }
        match self.rx.blocking_recv() {
            Some(Ok(chunk)) => {
                if chunk.is_empty() {
                    self.done = true;
                }
                Ok(Some(chunk))
            }
            Some(Err(e)) => {
                self.done = true;
                self.rx.close();
                Err(e)
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }
}
