use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc, Mutex, PoisonError, TryLockError,
};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    FromSample, SampleFormat, SizedSample, Stream, StreamConfig,
};
use tracing::{debug, error, info, warn};

use super::{BlockPump, OutputDriver};
use crate::{
    config::AudioConfig,
    stream::{BoxedStream, Sample},
    PlayerError, Result,
};

const STOPPED: u8 = 0;
const PLAYING: u8 = 1;
const PAUSED: u8 = 2;

/// Chain head plus the pump that re-blocks reads from it. Kept together so
/// swapping the head also drops any partly played block of the old one.
struct HeadSlot {
    head: Option<BoxedStream>,
    pump: BlockPump,
}

impl HeadSlot {
    fn new(block_len: usize) -> Self {
        Self {
            head: None,
            pump: BlockPump::new(block_len),
        }
    }

    fn replace(&mut self, head: Option<BoxedStream>) -> Option<BoxedStream> {
        self.pump.reset();
        std::mem::replace(&mut self.head, head)
    }

    fn fill(&mut self, samples: &mut [Sample]) {
        match self.head.as_mut() {
            Some(head) => {
                self.pump.fill(head.as_mut(), samples);
            }
            None => samples.fill(0),
        }
    }
}

type SharedSlot = Arc<Mutex<HeadSlot>>;

/// Output driver backed by the default cpal device.
///
/// The chain head lives behind a mutex shared with the device callback. The
/// callback only ever `try_lock`s it, so a control-plane swap costs at most
/// one block of silence instead of stalling the audio thread.
pub struct DeviceOutput {
    stream: Stream,
    slot: SharedSlot,
    transport: Arc<AtomicU8>,
    sample_rate: u32,
    channels: u16,
}

impl DeviceOutput {
    /// Opens the default output device in the chain's fixed format. Frames
    /// are pulled from the head in blocks of `block_len` samples.
    pub fn open(audio: &AudioConfig, block_len: usize) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PlayerError::Device("no output device available".into()))?;
        let supported = device
            .default_output_config()
            .map_err(|e| PlayerError::Device(format!("failed to query output config: {e}")))?;

        let config = StreamConfig {
            channels: audio.channels,
            sample_rate: cpal::SampleRate(audio.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let slot: SharedSlot = Arc::new(Mutex::new(HeadSlot::new(block_len)));
        let transport = Arc::new(AtomicU8::new(STOPPED));

        let stream = match supported.sample_format() {
            SampleFormat::I16 => build_stream::<i16>(&device, &config, &slot, &transport, block_len)?,
            SampleFormat::F32 => build_stream::<f32>(&device, &config, &slot, &transport, block_len)?,
            SampleFormat::U16 => build_stream::<u16>(&device, &config, &slot, &transport, block_len)?,
            format => {
                return Err(PlayerError::Device(format!(
                    "unsupported sample format: {format:?}"
                )))
            }
        };

        info!(
            device = %device.name().unwrap_or_else(|_| "unknown".into()),
            sample_rate = audio.sample_rate,
            channels = audio.channels,
            "audio output opened"
        );

        Ok(Self {
            stream,
            slot,
            transport,
            sample_rate: audio.sample_rate,
            channels: audio.channels,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    slot: &SharedSlot,
    transport: &Arc<AtomicU8>,
    block_len: usize,
) -> Result<Stream>
where
    T: SizedSample + FromSample<Sample>,
{
    let slot = Arc::clone(slot);
    let transport = Arc::clone(transport);
    let mut scratch: Vec<Sample> = vec![0; block_len.max(1)];

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let playing = transport.load(Ordering::Acquire) == PLAYING;
                for chunk in data.chunks_mut(scratch.len()) {
                    let samples = &mut scratch[..chunk.len()];
                    if !playing {
                        samples.fill(0);
                    } else {
                        match slot.try_lock() {
                            Ok(mut guard) => guard.fill(samples),
                            Err(TryLockError::WouldBlock) => samples.fill(0),
                            Err(TryLockError::Poisoned(poisoned)) => {
                                poisoned.into_inner().fill(samples)
                            }
                        }
                    }

                    for (out, sample) in chunk.iter_mut().zip(samples.iter()) {
                        *out = T::from_sample(*sample);
                    }
                }
            },
            move |err| {
                error!(%err, "audio output stream error");
            },
            None,
        )
        .map_err(|e| PlayerError::Device(format!("failed to build output stream: {e}")))
}

impl OutputDriver for DeviceOutput {
    fn set_stream(&mut self, head: Option<BoxedStream>) -> Option<BoxedStream> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(head)
    }

    fn play(&mut self) -> Result<()> {
        self.stream
            .play()
            .map_err(|e| PlayerError::Device(format!("failed to start output: {e}")))?;
        self.transport.store(PLAYING, Ordering::Release);
        debug!("device output playing");
        Ok(())
    }

    fn pause(&mut self) {
        if self.transport.load(Ordering::Acquire) == PLAYING {
            self.transport.store(PAUSED, Ordering::Release);
            debug!("device output paused");
        }
    }

    fn stop(&mut self) {
        self.transport.store(STOPPED, Ordering::Release);
        if let Err(err) = self.stream.pause() {
            warn!(%err, "failed to pause output stream");
        }
        debug!("device output stopped");
    }

    fn is_playing(&self) -> bool {
        self.transport.load(Ordering::Acquire) == PLAYING
    }

    fn is_paused(&self) -> bool {
        self.transport.load(Ordering::Acquire) == PAUSED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;

    #[test]
    fn swapping_head_drops_partial_block() {
        let mut slot = HeadSlot::new(8);
        assert!(slot.replace(Some(Box::new(MemoryStream::new(vec![1; 64])))).is_none());

        let mut samples = [0; 3];
        slot.fill(&mut samples);
        assert_eq!(samples, [1; 3]);

        assert!(slot.replace(Some(Box::new(MemoryStream::new(vec![2; 64])))).is_some());
        slot.fill(&mut samples);
        assert_eq!(samples, [2; 3]);
    }

    #[test]
    fn empty_slot_is_silent() {
        let mut slot = HeadSlot::new(4);
        let mut samples = [5; 6];
        slot.fill(&mut samples);
        assert_eq!(samples, [0; 6]);
    }
}
