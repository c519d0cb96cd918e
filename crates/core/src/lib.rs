//! Core library for the spectrum player.
//!
//! Playback is a pull-based chain of stages sharing one read contract
//! ([`AudioStream`]). An output driver pulls fixed-size blocks from the head
//! of the chain; each stage pulls from the stage it wraps:
//!
//! ```text
//! DirectoryStream -> BufferedStream -> AnalyserStream -> GainStream -> output
//! ```
//!
//! Control threads talk to a running chain only through cloneable handles
//! ([`SkipHandle`], [`VolumeControl`], [`SpectrumHandle`] and the
//! [`TrackEvent`] channel), never by reaching into the stages.

pub mod analysis;
pub mod audio;
pub mod buffer;
pub mod config;
pub mod decode;
pub mod error;
pub mod gain;
pub mod library;
pub mod output;
pub mod sequence;
pub mod stream;

pub use analysis::{AnalyserStream, SpectrumFrame, SpectrumHandle};
pub use audio::{ChainControls, PlaybackChain, Player};
pub use buffer::BufferedStream;
pub use config::{AnalyserConfig, AppConfig, AudioConfig, BufferConfig, LibraryConfig};
pub use decode::{DecoderFactory, DecoderStream, SymphoniaFactory};
pub use error::{PlayerError, Result};
pub use gain::{GainStream, VolumeControl};
pub use library::scan_directory;
pub use output::{BlockPump, DeviceOutput, OfflineOutput, OutputDriver};
pub use sequence::{DirectoryStream, SkipHandle, TrackEvent};
pub use stream::{AudioStream, BoxedStream, MemoryStream, Sample};
