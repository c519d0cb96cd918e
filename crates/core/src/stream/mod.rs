//! Pull interface shared by every stage of the playback chain.
//!
//! A chain is built tail first: each stage takes ownership of its upstream
//! and transforms samples as the output driver pulls them through `read`.

/// Fixed sample type of the chain: signed 16-bit, interleaved channels.
pub type Sample = i16;

/// Owned, thread-transferable stage.
pub type BoxedStream = Box<dyn AudioStream>;

/// A stage in the pull-based chain.
///
/// `read` must never block for unbounded time or panic. A return value smaller
/// than `buffer.len()` signals that the stage is exhausted; the contents of
/// `buffer` past the returned count are unspecified.
pub trait AudioStream: Send {
    /// Fills `buffer` from upstream and returns the number of samples produced.
    fn read(&mut self, buffer: &mut [Sample]) -> usize;

    /// Read-only stages accept nothing.
    fn write(&mut self, _buffer: &[Sample]) -> usize {
        0
    }

    /// Acquires resources and starts background work. `false` means the stage
    /// is unusable.
    fn start(&mut self) -> bool {
        true
    }
}

impl AudioStream for BoxedStream {
    fn read(&mut self, buffer: &mut [Sample]) -> usize {
        (**self).read(buffer)
    }

    fn write(&mut self, buffer: &[Sample]) -> usize {
        (**self).write(buffer)
    }

    fn start(&mut self) -> bool {
        (**self).start()
    }
}

/// Reads from an optional upstream, treating a missing one as exhausted.
pub(crate) fn read_upstream(upstream: Option<&mut BoxedStream>, buffer: &mut [Sample]) -> usize {
    match upstream {
        Some(stream) => stream.read(buffer).min(buffer.len()),
        None => 0,
    }
}

/// Finite in-memory source.
///
/// Used as a stand-in decoder by tests and offline tooling.
#[derive(Debug, Clone, Default)]
pub struct MemoryStream {
    samples: Vec<Sample>,
    position: usize,
}

impl MemoryStream {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self {
            samples,
            position: 0,
        }
    }

    /// Samples not yet handed out.
    pub fn remaining(&self) -> usize {
        self.samples.len() - self.position
    }
}

impl AudioStream for MemoryStream {
    fn read(&mut self, buffer: &mut [Sample]) -> usize {
        let count = buffer.len().min(self.remaining());
        buffer[..count].copy_from_slice(&self.samples[self.position..self.position + count]);
        self.position += count;
        count
    }

    fn write(&mut self, buffer: &[Sample]) -> usize {
        self.samples.extend_from_slice(buffer);
        buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_stream_reports_short_read_at_end() {
        let mut stream = MemoryStream::new((0..10).collect());
        let mut buffer = [0; 4];

        assert_eq!(stream.read(&mut buffer), 4);
        assert_eq!(stream.read(&mut buffer), 4);
        assert_eq!(stream.read(&mut buffer), 2);
        assert_eq!(&buffer[..2], &[8, 9]);
        assert_eq!(stream.read(&mut buffer), 0);
    }

    #[test]
    fn missing_upstream_yields_nothing() {
        let mut buffer = [7; 8];
        assert_eq!(read_upstream(None, &mut buffer), 0);

        let mut boxed: BoxedStream = Box::new(MemoryStream::new(vec![1; 3]));
        assert!(boxed.start());
        assert_eq!(read_upstream(Some(&mut boxed), &mut buffer), 3);
    }
}
