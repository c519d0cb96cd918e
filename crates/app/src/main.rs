use std::{
    io::BufRead,
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use clap::{Parser, Subcommand};
use crossbeam_channel::{bounded, Receiver, TryRecvError};
use serde::Serialize;
use spectrum_player_core::{
    scan_directory, AppConfig, ChainControls, DeviceOutput, OfflineOutput, OutputDriver, Player,
    SpectrumFrame, SymphoniaFactory, TrackEvent,
};
use tracing_subscriber::EnvFilter;

const OBSERVER_PERIOD: Duration = Duration::from_micros(16_667);
const VOLUME_STEP: f32 = 0.05;
/// Consecutive empty pulls after the queue finished before offline analysis
/// stops.
const DRAIN_ATTEMPTS: usize = 8;

fn main() -> spectrum_player_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Play { path } => run_play(config, &path),
        Commands::Analyse { path, output } => run_analyse(config, &path, &output),
        Commands::Scan { dir } => run_scan(&config, &dir),
    }
}

fn load_config(cli: &Cli) -> spectrum_player_core::Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if let Some(volume) = cli.volume {
        config.audio.volume = volume.clamp(0.0, 1.0);
    }
    if let Some(extension) = &cli.extension {
        config.library.extension = extension.clone();
    }
    config.validate()?;
    Ok(config)
}

#[derive(Debug, Clone, Copy)]
enum Control {
    Next,
    TogglePause,
    VolumeUp,
    VolumeDown,
    Quit,
}

/// Reads single-letter commands from stdin until it closes.
fn spawn_controls() -> Receiver<Control> {
    let (tx, rx) = bounded(8);
    let spawned = thread::Builder::new()
        .name("stdin-controls".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                let control = match line.trim() {
                    "n" => Control::Next,
                    "p" => Control::TogglePause,
                    "+" => Control::VolumeUp,
                    "-" => Control::VolumeDown,
                    "q" => Control::Quit,
                    "" => continue,
                    other => {
                        tracing::warn!(command = other, "unknown command (n, p, +, -, q)");
                        continue;
                    }
                };
                if tx.send(control).is_err() {
                    break;
                }
            }
        });
    if let Err(err) = spawned {
        tracing::warn!(%err, "failed to spawn stdin reader, controls disabled");
    }
    rx
}

/// Opens `path` as a single file or as a directory queue.
fn open<O: OutputDriver>(
    player: &mut Player<O>,
    path: &Path,
) -> spectrum_player_core::Result<ChainControls> {
    if path.is_file() {
        player.open_file(path)
    } else {
        player.open_directory(path)
    }
}

fn run_play(config: AppConfig, path: &Path) -> spectrum_player_core::Result<()> {
    tracing::info!(path = %path.display(), "starting playback");

    let output = DeviceOutput::open(&config.audio, config.block_len())?;
    let factory = Arc::new(SymphoniaFactory::new(&config.audio));
    let mut player = Player::new(config, output, factory);
    let controls = open(&mut player, path)?;
    let commands = spawn_controls();

    let mut bins = Vec::new();
    let mut last_generation = 0;
    loop {
        let tick = Instant::now();

        match commands.try_recv() {
            Ok(Control::Next) => player.skip_track(),
            Ok(Control::TogglePause) => {
                if player.is_paused() {
                    player.play()?;
                } else {
                    player.pause();
                }
            }
            Ok(Control::VolumeUp) => player.set_volume(controls.volume.get() + VOLUME_STEP),
            Ok(Control::VolumeDown) => player.set_volume(controls.volume.get() - VOLUME_STEP),
            Ok(Control::Quit) => break,
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
        }

        let mut finished = false;
        for event in controls.track_events.try_iter() {
            match event {
                TrackEvent::Started(path) | TrackEvent::Changed(path) => {
                    tracing::info!(track = %path.display(), "now playing");
                }
                TrackEvent::Finished => finished = true,
            }
        }
        if finished {
            tracing::info!("queue finished");
            break;
        }

        let generation = controls.spectrum.generation()?;
        if generation != last_generation {
            last_generation = generation;
            let count = controls.spectrum.copy_bins(&mut bins, controls.spectrum.bin_count())?;
            let peak = bins[..count]
                .iter()
                .enumerate()
                .fold((0, 0.0f32), |best, (bin, &level)| {
                    if level > best.1 {
                        (bin, level)
                    } else {
                        best
                    }
                });
            tracing::trace!(generation, peak_bin = peak.0, peak_level = peak.1, "spectrum");
        }

        if let Some(rest) = OBSERVER_PERIOD.checked_sub(tick.elapsed()) {
            thread::sleep(rest);
        }
    }

    player.stop();
    Ok(())
}

#[derive(Debug, Serialize)]
struct AnalysisReport {
    source: PathBuf,
    sample_rate: u32,
    frame_size: usize,
    bin_count: usize,
    tracks: Vec<PathBuf>,
    frames: Vec<SpectrumFrame>,
}

fn run_analyse(config: AppConfig, path: &Path, output: &Path) -> spectrum_player_core::Result<()> {
    tracing::info!(path = %path.display(), output = %output.display(), "running offline analysis");

    let block_len = config.block_len();
    let sample_rate = config.audio.sample_rate;
    let frame_size = config.analyser.frame_size;
    let bin_count = config.analyser.bin_count;
    let factory = Arc::new(SymphoniaFactory::new(&config.audio));
    let mut player = Player::new(config, OfflineOutput::new(block_len), factory);
    let controls = open(&mut player, path)?;

    let mut block = vec![0; block_len];
    let mut tracks = Vec::new();
    let mut frames = Vec::new();
    let mut finished = false;
    let mut idle = 0;

    while !(finished && idle >= DRAIN_ATTEMPTS) {
        for event in controls.track_events.try_iter() {
            match event {
                TrackEvent::Started(path) | TrackEvent::Changed(path) => tracks.push(path),
                TrackEvent::Finished => finished = true,
            }
        }

        if player.output_mut().render(&mut block) == 0 {
            idle += 1;
            thread::sleep(Duration::from_millis(1));
            continue;
        }
        idle = 0;
        frames.push(controls.spectrum.snapshot()?);
    }
    player.stop();

    tracing::info!(frames = frames.len(), tracks = tracks.len(), "analysis complete");
    let report = AnalysisReport {
        source: path.to_path_buf(),
        sample_rate,
        frame_size,
        bin_count,
        tracks,
        frames,
    };
    let file = std::fs::File::create(output)?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), &report)?;
    Ok(())
}

fn run_scan(config: &AppConfig, dir: &Path) -> spectrum_player_core::Result<()> {
    let tracks = scan_directory(dir, &config.library.extension)?;
    tracing::info!(dir = %dir.display(), tracks = tracks.len(), "scanned directory");
    for (index, track) in tracks.iter().enumerate() {
        println!("{:>4}  {}", index + 1, track.display());
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Gapless directory player with a live spectrum", long_about = None)]
struct Cli {
    /// JSON configuration file; defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Initial volume in [0, 1].
    #[arg(long, global = true)]
    volume: Option<f32>,
    /// Track file extension to queue.
    #[arg(long, global = true)]
    extension: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play a file, or every track in a directory, through the default output device.
    Play {
        /// Audio file or directory holding the tracks.
        path: PathBuf,
    },
    /// Run the chain offline and write every published spectrum as JSON.
    Analyse {
        /// Audio file or directory holding the tracks.
        path: PathBuf,
        /// Output path for the spectrum report.
        #[arg(short, long)]
        output: PathBuf,
    },
    /// List the tracks that would be queued, in playback order.
    Scan {
        /// Directory to scan.
        dir: PathBuf,
    },
}
