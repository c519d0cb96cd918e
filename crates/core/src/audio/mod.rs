use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use crossbeam_channel::Receiver;
use tracing::{debug, info};

use crate::{
    AnalyserStream, AppConfig, AudioStream, BoxedStream, BufferedStream, DecoderFactory,
    DirectoryStream, GainStream, OutputDriver, PlayerError, Result, Sample, SkipHandle,
    SpectrumHandle, TrackEvent, VolumeControl,
};

/// Side channels into a running chain. Cheap to clone; none of them keep the
/// chain alive.
#[derive(Debug, Clone)]
pub struct ChainControls {
    pub skip: SkipHandle,
    pub volume: VolumeControl,
    pub spectrum: SpectrumHandle,
    pub track_events: Receiver<TrackEvent>,
}

/// One playback session: track queue → buffer → analyser → gain.
///
/// Dropping the chain tears it down from the head: the gain and analyser
/// stages go first, then the buffered stage joins its producer thread, which
/// releases the queue and its decoders.
pub struct PlaybackChain {
    head: GainStream,
    origin: PathBuf,
    controls: ChainControls,
}

impl PlaybackChain {
    /// Builds and starts a chain over every matching track in `root`.
    ///
    /// Nothing keeps running if this fails.
    pub fn build(
        config: &AppConfig,
        root: impl AsRef<Path>,
        factory: Arc<dyn DecoderFactory>,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let queue = DirectoryStream::new(&root, &config.library.extension, factory);
        Self::assemble(config, root, queue)
    }

    /// Builds and starts a chain that plays a single file.
    pub fn build_file(
        config: &AppConfig,
        path: impl AsRef<Path>,
        factory: Arc<dyn DecoderFactory>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_file() {
            return Err(PlayerError::msg(format!("not a playable file: {}", path.display())));
        }
        let queue = DirectoryStream::from_tracks(vec![path.clone()], factory);
        Self::assemble(config, path, queue)
    }

    /// Wraps an unstarted queue in the rest of the chain. Starting the
    /// buffered stage starts the queue exactly once.
    fn assemble(config: &AppConfig, origin: PathBuf, queue: DirectoryStream) -> Result<Self> {
        config.validate()?;
        let skip = queue.skip_handle();
        let track_events = queue.track_events();

        let mut buffered = BufferedStream::new(Box::new(queue), &config.buffer)?;
        if !buffered.start() {
            return Err(PlayerError::msg(format!(
                "failed to start playback of {}",
                origin.display()
            )));
        }

        let analyser = AnalyserStream::new(Box::new(buffered), &config.analyser)?;
        let spectrum = analyser.spectrum();

        let volume = VolumeControl::new(config.audio.volume);
        let head = GainStream::new(Box::new(analyser), volume.clone());

        info!(origin = %origin.display(), "playback chain ready");
        Ok(Self {
            head,
            origin,
            controls: ChainControls {
                skip,
                volume,
                spectrum,
                track_events,
            },
        })
    }

    pub fn controls(&self) -> ChainControls {
        self.controls.clone()
    }

    /// Directory or file the chain was built over.
    pub fn origin(&self) -> &Path {
        &self.origin
    }
}

impl AudioStream for PlaybackChain {
    fn read(&mut self, buffer: &mut [Sample]) -> usize {
        self.head.read(buffer)
    }
}

impl fmt::Debug for PlaybackChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackChain")
            .field("origin", &self.origin)
            .finish()
    }
}

/// High level player façade: owns the output driver and the single active
/// chain attached to it.
pub struct Player<O: OutputDriver> {
    config: AppConfig,
    output: O,
    factory: Arc<dyn DecoderFactory>,
    controls: Option<ChainControls>,
}

impl<O: OutputDriver> Player<O> {
    pub fn new(config: AppConfig, output: O, factory: Arc<dyn DecoderFactory>) -> Self {
        Self {
            config,
            output,
            factory,
            controls: None,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }

    /// Replaces the active chain with one over `root` and starts playing it.
    ///
    /// The new chain is built first; if that fails the current playback is
    /// left as it was. Otherwise the output is stopped and the old chain is
    /// detached and torn down before the new one is attached.
    pub fn open_directory(&mut self, root: impl AsRef<Path>) -> Result<ChainControls> {
        let chain = PlaybackChain::build(&self.config, root, Arc::clone(&self.factory))?;
        self.attach(chain)
    }

    /// Like [`Player::open_directory`], for a single file.
    pub fn open_file(&mut self, path: impl AsRef<Path>) -> Result<ChainControls> {
        let chain = PlaybackChain::build_file(&self.config, path, Arc::clone(&self.factory))?;
        self.attach(chain)
    }

    fn attach(&mut self, chain: PlaybackChain) -> Result<ChainControls> {
        let controls = chain.controls();
        if let Some(previous) = &self.controls {
            controls.volume.set(previous.volume.get());
        }

        self.output.stop();
        if let Some(previous) = self.output.set_stream(None) {
            debug!("tearing down previous chain");
            drop(previous);
        }

        self.output.set_stream(Some(Box::new(chain) as BoxedStream));
        self.controls = Some(controls.clone());
        self.output.play()?;
        Ok(controls)
    }

    pub fn play(&mut self) -> Result<()> {
        if self.controls.is_none() {
            return Err(PlayerError::msg("nothing to play"));
        }
        self.output.play()
    }

    pub fn pause(&mut self) {
        self.output.pause();
    }

    /// Stops the output and tears the chain down.
    pub fn stop(&mut self) {
        self.output.stop();
        drop(self.output.set_stream(None));
        self.controls = None;
    }

    pub fn is_playing(&self) -> bool {
        self.output.is_playing()
    }

    pub fn is_paused(&self) -> bool {
        self.output.is_paused()
    }

    pub fn skip_track(&self) {
        if let Some(controls) = &self.controls {
            controls.skip.skip();
        }
    }

    pub fn set_volume(&self, volume: f32) {
        if let Some(controls) = &self.controls {
            controls.volume.set(volume);
        }
    }

    pub fn volume(&self) -> Option<f32> {
        self.controls.as_ref().map(|c| c.volume.get())
    }

    pub fn spectrum(&self) -> Option<SpectrumHandle> {
        self.controls.as_ref().map(|c| c.spectrum.clone())
    }

    pub fn track_events(&self) -> Option<Receiver<TrackEvent>> {
        self.controls.as_ref().map(|c| c.track_events.clone())
    }
}

impl<O: OutputDriver> Drop for Player<O> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<O: OutputDriver> fmt::Debug for Player<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Player")
            .field("playing", &self.output.is_playing())
            .field("paused", &self.output.is_paused())
            .field("active", &self.controls.is_some())
            .finish()
    }
}
