//! Output drivers: whatever repeatedly pulls the head of the chain.

mod device;

pub use device::DeviceOutput;

use tracing::debug;

use crate::{
    stream::{AudioStream, BoxedStream, Sample},
    PlayerError, Result,
};

/// Control surface of an output driver.
///
/// The driver owns the chain head it is given and calls `read` on it from its
/// own cadence. Swapping the head hands the previous one back to the caller so
/// it can be torn down outside the audio path.
pub trait OutputDriver {
    /// Installs a new head and returns the previous one.
    fn set_stream(&mut self, head: Option<BoxedStream>) -> Option<BoxedStream>;
    fn play(&mut self) -> Result<()>;
    fn pause(&mut self);
    fn stop(&mut self);
    fn is_playing(&self) -> bool;
    fn is_paused(&self) -> bool;
}

/// Re-blocks arbitrary callback sizes into fixed-length reads of the head.
///
/// The analyser only runs on blocks of exactly its expected length, while
/// device callbacks come in whatever size the host picks.
#[derive(Debug)]
pub struct BlockPump {
    block: Vec<Sample>,
    cursor: usize,
    /// Samples of `block` that came from the head; the rest is padding.
    filled: usize,
}

impl BlockPump {
    pub fn new(block_len: usize) -> Self {
        let block_len = block_len.max(1);
        Self {
            block: vec![0; block_len],
            cursor: block_len,
            filled: 0,
        }
    }

    pub fn block_len(&self) -> usize {
        self.block.len()
    }

    /// Fills `output` entirely, pulling whole blocks from `head` as needed.
    /// Short reads are padded with silence. Returns the number of samples
    /// that came from the head.
    pub fn fill(&mut self, head: &mut dyn AudioStream, output: &mut [Sample]) -> usize {
        let mut written = 0;
        let mut audible = 0;

        while written < output.len() {
            if self.cursor == self.block.len() {
                let produced = head.read(&mut self.block).min(self.block.len());
                self.block[produced..].fill(0);
                self.filled = produced;
                self.cursor = 0;
            }

            let take = (output.len() - written).min(self.block.len() - self.cursor);
            output[written..written + take]
                .copy_from_slice(&self.block[self.cursor..self.cursor + take]);
            audible += self.filled.saturating_sub(self.cursor).min(take);
            written += take;
            self.cursor += take;
        }

        audible
    }

    /// Drops any partially consumed block.
    pub fn reset(&mut self) {
        self.cursor = self.block.len();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    Stopped,
    Playing,
    Paused,
}

/// Driver that only pulls when asked to, for offline analysis and tests.
pub struct OfflineOutput {
    head: Option<BoxedStream>,
    pump: BlockPump,
    transport: Transport,
}

impl OfflineOutput {
    pub fn new(block_len: usize) -> Self {
        Self {
            head: None,
            pump: BlockPump::new(block_len),
            transport: Transport::Stopped,
        }
    }

    /// Pulls `output.len()` samples through the chain as a device callback
    /// would. Outputs silence and returns 0 unless playing.
    pub fn render(&mut self, output: &mut [Sample]) -> usize {
        match (self.transport, self.head.as_mut()) {
            (Transport::Playing, Some(head)) => self.pump.fill(head.as_mut(), output),
            _ => {
                output.fill(0);
                0
            }
        }
    }

    pub fn block_len(&self) -> usize {
        self.pump.block_len()
    }
}

impl OutputDriver for OfflineOutput {
    fn set_stream(&mut self, head: Option<BoxedStream>) -> Option<BoxedStream> {
        self.pump.reset();
        std::mem::replace(&mut self.head, head)
    }

    fn play(&mut self) -> Result<()> {
        if self.head.is_none() {
            return Err(PlayerError::msg("no stream attached to output"));
        }
        self.transport = Transport::Playing;
        debug!("offline output playing");
        Ok(())
    }

    fn pause(&mut self) {
        if self.transport == Transport::Playing {
            self.transport = Transport::Paused;
        }
    }

    fn stop(&mut self) {
        self.transport = Transport::Stopped;
        self.pump.reset();
    }

    fn is_playing(&self) -> bool {
        self.transport == Transport::Playing
    }

    fn is_paused(&self) -> bool {
        self.transport == Transport::Paused
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;

    /// Records the length of every read it serves.
    struct Recording {
        inner: MemoryStream,
        reads: Vec<usize>,
    }

    impl AudioStream for Recording {
        fn read(&mut self, buffer: &mut [Sample]) -> usize {
            self.reads.push(buffer.len());
            self.inner.read(buffer)
        }
    }

    #[test]
    fn pump_reads_whole_blocks_only() {
        let mut head = Recording {
            inner: MemoryStream::new((1..=40).collect()),
            reads: Vec::new(),
        };
        let mut pump = BlockPump::new(16);

        let mut output = vec![0; 10];
        let mut collected = Vec::new();
        for _ in 0..4 {
            pump.fill(&mut head, &mut output);
            collected.extend_from_slice(&output);
        }

        assert!(head.reads.iter().all(|&len| len == 16));
        assert_eq!(head.reads.len(), 3);
        assert_eq!(&collected[..40], (1..=40).collect::<Vec<Sample>>().as_slice());
    }

    #[test]
    fn pump_pads_short_reads_with_silence() {
        let mut head = MemoryStream::new(vec![9; 5]);
        let mut pump = BlockPump::new(8);
        let mut output = vec![1; 12];

        let audible = pump.fill(&mut head, &mut output);
        assert_eq!(audible, 5);
        assert_eq!(&output[..5], &[9; 5]);
        assert!(output[5..].iter().all(|&s| s == 0));
    }

    #[test]
    fn offline_output_is_silent_unless_playing() {
        let mut output = OfflineOutput::new(4);
        assert!(output.play().is_err());

        assert!(output
            .set_stream(Some(Box::new(MemoryStream::new(vec![3; 16]))))
            .is_none());
        let mut block = [7; 4];
        assert_eq!(output.render(&mut block), 0);
        assert_eq!(block, [0; 4]);

        output.play().unwrap();
        assert!(output.is_playing());
        assert_eq!(output.render(&mut block), 4);
        assert_eq!(block, [3; 4]);

        output.pause();
        assert!(output.is_paused());
        assert_eq!(output.render(&mut block), 0);

        output.stop();
        assert!(!output.is_playing() && !output.is_paused());
        assert!(output.set_stream(None).is_some());
    }
}
