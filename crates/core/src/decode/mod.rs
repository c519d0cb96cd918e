//! File decoding collaborator.
//!
//! The sequencing stage never decodes anything itself; it asks a
//! [`DecoderFactory`] for a fresh stage per track and calls `start` on it.
//! [`DecoderStream`] is the symphonia-backed implementation used in
//! production.

use std::{
    fmt,
    fs::File,
    path::{Path, PathBuf},
};

use symphonia::core::{
    audio::SampleBuffer,
    codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader},
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};
use tracing::{debug, warn};

use crate::{
    config::AudioConfig,
    stream::{AudioStream, BoxedStream, Sample},
};

/// Creates an unstarted decode stage for a track.
pub trait DecoderFactory: Send + Sync {
    fn create(&self, path: &Path) -> BoxedStream;
}

impl<F> DecoderFactory for F
where
    F: Fn(&Path) -> BoxedStream + Send + Sync,
{
    fn create(&self, path: &Path) -> BoxedStream {
        self(path)
    }
}

/// Factory producing [`DecoderStream`]s in the chain's output format.
#[derive(Debug, Clone)]
pub struct SymphoniaFactory {
    audio: AudioConfig,
}

impl SymphoniaFactory {
    pub fn new(audio: &AudioConfig) -> Self {
        Self {
            audio: audio.clone(),
        }
    }
}

impl DecoderFactory for SymphoniaFactory {
    fn create(&self, path: &Path) -> BoxedStream {
        Box::new(DecoderStream::new(path, &self.audio))
    }
}

struct OpenTrack {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
}

/// Pull-style decoder for one file, producing interleaved i16 samples in the
/// configured channel layout.
pub struct DecoderStream {
    path: PathBuf,
    channels: usize,
    sample_rate: u32,
    open: Option<OpenTrack>,
    pending: Vec<Sample>,
    cursor: usize,
    finished: bool,
}

impl DecoderStream {
    pub fn new(path: impl Into<PathBuf>, audio: &AudioConfig) -> Self {
        Self {
            path: path.into(),
            channels: audio.channels as usize,
            sample_rate: audio.sample_rate,
            open: None,
            pending: Vec::new(),
            cursor: 0,
            finished: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> std::result::Result<OpenTrack, String> {
        let file = File::open(&self.path).map_err(|e| format!("failed to open file: {e}"))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = self.path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| format!("failed to probe format: {e}"))?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| "no audio track found".to_string())?;

        if let Some(rate) = track.codec_params.sample_rate {
            if rate != self.sample_rate {
                warn!(
                    path = %self.path.display(),
                    file_rate = rate,
                    output_rate = self.sample_rate,
                    "sample rate mismatch, playback speed will be off"
                );
            }
        }

        let track_id = track.id;
        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| format!("failed to create decoder: {e}"))?;

        Ok(OpenTrack {
            format,
            decoder,
            track_id,
        })
    }

    /// Decodes packets until something lands in `pending` or the track ends.
    fn refill(&mut self) {
        let channels = self.channels;
        let Some(open) = self.open.as_mut() else {
            self.finished = true;
            return;
        };

        self.pending.clear();
        self.cursor = 0;

        while self.pending.is_empty() {
            let packet = match open.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    debug!(path = %self.path.display(), "end of track");
                    self.finished = true;
                    return;
                }
                Err(SymphoniaError::ResetRequired) => {
                    open.decoder.reset();
                    continue;
                }
                Err(err) => {
                    warn!(path = %self.path.display(), %err, "failed to read packet, ending track");
                    self.finished = true;
                    return;
                }
            };

            if packet.track_id() != open.track_id {
                continue;
            }

            match open.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let mut samples = SampleBuffer::<Sample>::new(decoded.capacity() as u64, spec);
                    samples.copy_interleaved_ref(decoded);
                    remap_channels(samples.samples(), spec.channels.count(), channels, &mut self.pending);
                }
                Err(SymphoniaError::DecodeError(err)) => {
                    warn!(path = %self.path.display(), %err, "decode error, skipping packet");
                }
                Err(err) => {
                    warn!(path = %self.path.display(), %err, "decoder failed, ending track");
                    self.finished = true;
                    return;
                }
            }
        }
    }
}

impl AudioStream for DecoderStream {
    fn read(&mut self, buffer: &mut [Sample]) -> usize {
        let mut written = 0;
        while written < buffer.len() {
            if self.cursor == self.pending.len() {
                if self.finished {
                    break;
                }
                self.refill();
                continue;
            }

            let take = (buffer.len() - written).min(self.pending.len() - self.cursor);
            buffer[written..written + take]
                .copy_from_slice(&self.pending[self.cursor..self.cursor + take]);
            written += take;
            self.cursor += take;
        }
        written
    }

    fn start(&mut self) -> bool {
        match self.open() {
            Ok(open) => {
                debug!(path = %self.path.display(), "decoder opened");
                self.open = Some(open);
                self.finished = false;
                true
            }
            Err(err) => {
                warn!(path = %self.path.display(), %err, "failed to start decoder");
                false
            }
        }
    }
}

impl fmt::Debug for DecoderStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderStream")
            .field("path", &self.path)
            .field("open", &self.open.is_some())
            .field("finished", &self.finished)
            .finish()
    }
}

/// Converts interleaved frames with `from` channels into `to` channels.
/// Mono is duplicated; surplus channels are dropped.
fn remap_channels(input: &[Sample], from: usize, to: usize, output: &mut Vec<Sample>) {
    if from == 0 || to == 0 {
        return;
    }
    if from == to {
        output.extend_from_slice(input);
        return;
    }

    for frame in input.chunks_exact(from) {
        for channel in 0..to {
            output.push(frame[channel.min(from - 1)]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;

    #[test]
    fn mono_is_duplicated_to_stereo() {
        let mut output = Vec::new();
        remap_channels(&[1, 2, 3], 1, 2, &mut output);
        assert_eq!(output, [1, 1, 2, 2, 3, 3]);
    }

    #[test]
    fn surplus_channels_are_dropped() {
        let mut output = Vec::new();
        remap_channels(&[1, 2, 3, 4, 5, 6], 3, 2, &mut output);
        assert_eq!(output, [1, 2, 4, 5]);
    }

    #[test]
    fn missing_file_fails_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = DecoderStream::new(dir.path().join("missing.mp3"), &AudioConfig::default());
        assert!(!stream.start());
        let mut block = [0; 16];
        assert_eq!(stream.read(&mut block), 0);
    }

    #[test]
    fn garbage_file_fails_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noise.mp3");
        std::fs::write(&path, b"definitely not an mpeg stream").unwrap();

        let factory = SymphoniaFactory::new(&AudioConfig::default());
        let mut stream = factory.create(&path);
        assert!(!stream.start());
    }

    #[test]
    fn closures_act_as_factories() {
        let factory = |_: &Path| -> BoxedStream { Box::new(MemoryStream::new(vec![5; 3])) };
        let mut stream = factory.create(Path::new("ignored.mp3"));
        let mut block = [0; 4];
        assert_eq!(stream.read(&mut block), 3);
    }
}
