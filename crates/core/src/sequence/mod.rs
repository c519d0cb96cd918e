//! Gapless sequencing over every track in a directory.
//!
//! [`DirectoryStream`] keeps two slots: the track currently being read and
//! the one after it, which is opened on a short-lived prefetch thread while
//! the current one plays. When the current track comes up short the next one
//! moves into its place and fills the rest of the caller's block, so
//! consecutive tracks join without silence.

use std::{
    fmt, mem,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, error, info, warn};

use crate::{
    decode::DecoderFactory,
    library::scan_directory,
    stream::{AudioStream, BoxedStream, Sample},
};

const EVENT_CAPACITY: usize = 16;

/// Notifications emitted as playback moves through the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackEvent {
    /// The first playable track was opened.
    Started(PathBuf),
    /// Playback moved on to another track.
    Changed(PathBuf),
    /// The queue ran out.
    Finished,
}

/// Requests a skip to the next track from any thread.
#[derive(Debug, Clone, Default)]
pub struct SkipHandle {
    flag: Arc<AtomicBool>,
}

impl SkipHandle {
    pub fn skip(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    fn take(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }
}

struct Track {
    index: usize,
    path: PathBuf,
    stream: BoxedStream,
}

/// Result of opening the next track: where the queue cursor ended up and
/// the track, if any entry could be started.
struct Prefetched {
    cursor: usize,
    track: Option<Track>,
}

enum NextSlot {
    Empty,
    Opening(JoinHandle<Prefetched>),
    Ready(Track),
}

/// Where the queue comes from when the stage starts.
#[derive(Debug)]
enum QueueSource {
    /// Every file in the root with this extension.
    Scan(String),
    /// A fixed list of files. Starting fails if none of them opens.
    Tracks(Vec<PathBuf>),
}

/// Source stage that plays every matching file in a directory, in
/// enumeration order.
pub struct DirectoryStream {
    root: PathBuf,
    source: QueueSource,
    started: bool,
    factory: Arc<dyn DecoderFactory>,
    playlist: Arc<[PathBuf]>,
    /// Index of the first queue entry not yet handed to a slot.
    cursor: usize,
    current: Option<Track>,
    next: NextSlot,
    skip: SkipHandle,
    events: Sender<TrackEvent>,
    receiver: Receiver<TrackEvent>,
    finished: bool,
}

impl DirectoryStream {
    pub fn new(
        root: impl Into<PathBuf>,
        extension: impl Into<String>,
        factory: Arc<dyn DecoderFactory>,
    ) -> Self {
        Self::with_source(root.into(), QueueSource::Scan(extension.into()), factory)
    }

    /// Queue over an explicit list of files, played in the given order.
    pub fn from_tracks(tracks: Vec<PathBuf>, factory: Arc<dyn DecoderFactory>) -> Self {
        let root = tracks
            .first()
            .and_then(|p| p.parent())
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self::with_source(root, QueueSource::Tracks(tracks), factory)
    }

    fn with_source(root: PathBuf, source: QueueSource, factory: Arc<dyn DecoderFactory>) -> Self {
        let (events, receiver) = bounded(EVENT_CAPACITY);
        Self {
            root,
            source,
            started: false,
            factory,
            playlist: Arc::from(Vec::new()),
            cursor: 0,
            current: None,
            next: NextSlot::Empty,
            skip: SkipHandle::default(),
            events,
            receiver,
            finished: false,
        }
    }

    /// Every track enumerated at start, in playback order.
    pub fn playlist(&self) -> &[PathBuf] {
        &self.playlist
    }

    pub fn current_track(&self) -> Option<&Path> {
        self.current.as_ref().map(|t| t.path.as_path())
    }

    pub fn skip_handle(&self) -> SkipHandle {
        self.skip.clone()
    }

    /// Receiver for [`TrackEvent`]s. Events are dropped, not queued, when
    /// nobody drains it.
    pub fn track_events(&self) -> Receiver<TrackEvent> {
        self.receiver.clone()
    }

    fn notify(&self, event: TrackEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                debug!(?event, "track event channel full, dropping event");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn spawn_prefetch(&mut self) {
        if self.cursor >= self.playlist.len() {
            self.next = NextSlot::Empty;
            return;
        }

        let playlist = Arc::clone(&self.playlist);
        let factory = Arc::clone(&self.factory);
        let cursor = self.cursor;
        let spawned = thread::Builder::new()
            .name("track-prefetch".into())
            .spawn(move || open_from(&playlist, cursor, factory.as_ref()));

        self.next = match spawned {
            Ok(handle) => NextSlot::Opening(handle),
            Err(err) => {
                warn!(%err, "failed to spawn prefetch thread, opening inline");
                let prefetched = open_from(&self.playlist, self.cursor, self.factory.as_ref());
                self.cursor = prefetched.cursor;
                prefetched.track.map_or(NextSlot::Empty, NextSlot::Ready)
            }
        };
    }

    fn take_next(&mut self) -> Option<Track> {
        match mem::replace(&mut self.next, NextSlot::Empty) {
            NextSlot::Empty => None,
            NextSlot::Ready(track) => Some(track),
            NextSlot::Opening(handle) => match handle.join() {
                Ok(prefetched) => {
                    self.cursor = prefetched.cursor;
                    prefetched.track
                }
                Err(_) => {
                    error!("track prefetch thread panicked");
                    None
                }
            },
        }
    }

    /// Moves the prefetched track into the current slot and starts opening
    /// the one after it. Returns false once the queue is exhausted.
    fn advance(&mut self) -> bool {
        let finished = self.current.take();
        if let Some(track) = finished {
            debug!(index = track.index, path = %track.path.display(), "track finished");
        }

        self.current = self.take_next();
        match &self.current {
            Some(track) => {
                info!(index = track.index, path = %track.path.display(), "next track");
                self.notify(TrackEvent::Changed(track.path.clone()));
                self.spawn_prefetch();
                true
            }
            None => {
                if !self.finished {
                    info!("playlist finished");
                    self.finished = true;
                    self.notify(TrackEvent::Finished);
                }
                false
            }
        }
    }
}

impl AudioStream for DirectoryStream {
    fn read(&mut self, buffer: &mut [Sample]) -> usize {
        if self.current.is_none() {
            return 0;
        }

        let mut produced = if self.skip.take() {
            info!("skipping track");
            0
        } else {
            self.current
                .as_mut()
                .map_or(0, |track| track.stream.read(buffer).min(buffer.len()))
        };

        while produced < buffer.len() && self.advance() {
            if let Some(track) = self.current.as_mut() {
                let rest = &mut buffer[produced..];
                produced += track.stream.read(rest).min(rest.len());
            }
        }

        produced
    }

    fn start(&mut self) -> bool {
        if self.started {
            debug!(root = %self.root.display(), "track queue already started");
            return true;
        }

        let (playlist, explicit) = match &mut self.source {
            QueueSource::Scan(extension) => match scan_directory(&self.root, extension.as_str()) {
                Ok(playlist) => (playlist, false),
                Err(err) => {
                    error!(root = %self.root.display(), %err, "failed to enumerate tracks");
                    return false;
                }
            },
            QueueSource::Tracks(tracks) => (mem::take(tracks), true),
        };
        self.started = true;
        info!(root = %self.root.display(), tracks = playlist.len(), "track queue built");
        self.playlist = Arc::from(playlist);

        let first = open_from(&self.playlist, 0, self.factory.as_ref());
        self.cursor = first.cursor;
        self.current = first.track;

        match &self.current {
            Some(track) => {
                self.notify(TrackEvent::Started(track.path.clone()));
                self.spawn_prefetch();
            }
            None if explicit => {
                error!(root = %self.root.display(), "none of the given tracks could be opened");
                self.finished = true;
                return false;
            }
            None => {
                warn!(root = %self.root.display(), "no playable tracks");
                self.finished = true;
                self.notify(TrackEvent::Finished);
            }
        }
        true
    }
}

impl Drop for DirectoryStream {
    fn drop(&mut self) {
        if let NextSlot::Opening(handle) = mem::replace(&mut self.next, NextSlot::Empty) {
            if handle.join().is_err() {
                error!("track prefetch thread panicked");
            }
        }
    }
}

impl fmt::Debug for DirectoryStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryStream")
            .field("root", &self.root)
            .field("tracks", &self.playlist.len())
            .field("cursor", &self.cursor)
            .field("current", &self.current_track())
            .finish()
    }
}

/// Opens the first startable entry at or after `cursor`, skipping failures.
fn open_from(playlist: &[PathBuf], mut cursor: usize, factory: &dyn DecoderFactory) -> Prefetched {
    while let Some(path) = playlist.get(cursor) {
        let index = cursor;
        cursor += 1;

        let mut stream = factory.create(path);
        if stream.start() {
            return Prefetched {
                cursor,
                track: Some(Track {
                    index,
                    path: path.clone(),
                    stream,
                }),
            };
        }
        warn!(path = %path.display(), "could not open track, skipping");
    }

    Prefetched {
        cursor,
        track: None,
    }
}
