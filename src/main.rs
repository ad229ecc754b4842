use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam_channel::unbounded;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use detbank_gui::analysis::{AnalysisEvent, Analyser, ForwardingSink, ResultSink};
use detbank_gui::engine::ResonatorBank;
use detbank_gui::profile::{ProfileManager, DEFAULT_PROFILE_NAME};
use detbank_gui::registry::SegmentRegistry;
use detbank_gui::results::ResultsGrid;
use detbank_gui::settings::{self, ConfigStore, FileStore, MemoryStore};
use detbank_gui::params::DetectorChar;
use detbank_gui::{audio, export, gui, DetectorParams};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Audio file to analyse
    input: Option<PathBuf>,
    /// Segment in seconds, `START:STOP`; may be repeated
    #[arg(short, long = "segment", value_parser = parse_segment)]
    segments: Vec<(f64, f64)>,
    /// Keep every Nth sample of the detector output
    #[arg(short, long)]
    downsample: Option<usize>,
    /// Saved detection profile to use
    #[arg(short, long)]
    profile: Option<String>,
    /// CSV table of detector frequencies and bandwidths, replacing the profile's
    #[arg(short, long)]
    freqs: Option<PathBuf>,
    /// Directory for CSV results
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Output columns per progress update
    #[arg(long, default_value_t = 100)]
    progress_increment: usize,
    #[arg(long)]
    gui: bool,
}

fn parse_segment(text: &str) -> Result<(f64, f64), String> {
    let (start, stop) = text
        .split_once(':')
        .ok_or_else(|| format!("expected START:STOP, got '{}'", text))?;
    let start: f64 = start.trim().parse().map_err(|_| format!("invalid start '{}'", start))?;
    let stop: f64 = stop.trim().parse().map_err(|_| format!("invalid stop '{}'", stop))?;
    if start < 0.0 || stop < start {
        return Err(format!("invalid segment {}:{}", start, stop));
    }
    Ok((start, stop))
}

fn open_store() -> Box<dyn ConfigStore> {
    match FileStore::default_path() {
        Some(path) => Box::new(FileStore::open(path)),
        None => {
            warn!("No config directory, settings will not persist");
            Box::new(MemoryStore::default())
        }
    }
}

fn load_params(store: &dyn ConfigStore, name: Option<&str>) -> Result<DetectorParams> {
    let Some(path) = ProfileManager::default_path() else {
        return Ok(DetectorParams::default());
    };
    let mut manager = ProfileManager::open(path)?;
    manager.ensure_default()?;
    let name = name
        .map(str::to_string)
        .or_else(|| store.value(settings::DEFAULT_PROFILE))
        .unwrap_or_else(|| DEFAULT_PROFILE_NAME.into());
    manager.load(&name)
}

/// Apply the file's sample rate and any replacement table, then check every field.
fn headless_params(
    mut params: DetectorParams,
    sample_rate: u32,
    det_chars: Option<Vec<DetectorChar>>,
) -> Result<DetectorParams> {
    params.sample_rate = sample_rate as f64;
    if let Some(det_chars) = det_chars {
        params.det_chars = det_chars;
    }
    params.validate()?;
    Ok(params)
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let store = open_store();

    let input_path = match cli.input {
        Some(path) if !cli.gui => path,
        input => return gui::run(input, store),
    };

    println!("Loading audio: {:?}", input_path);
    let (samples, sample_rate) = audio::read_audio(&input_path)?;
    println!(
        "Audio loaded. Sample rate: {}, Duration: {:.2} s",
        sample_rate,
        samples.len() as f64 / sample_rate as f64
    );

    let det_chars = cli.freqs.as_deref().map(export::read_detector_chars).transpose()?;
    let params = headless_params(load_params(store.as_ref(), cli.profile.as_deref())?, sample_rate, det_chars)?;

    let mut registry = SegmentRegistry::new();
    registry.set_audio(samples.len(), sample_rate);
    for (i, &(start, stop)) in cli.segments.iter().enumerate() {
        if i == 0 {
            registry.set_segment_range(0, Some(start), Some(stop));
        } else {
            registry.add_segment(Some(start), Some(stop));
        }
    }
    let segments = registry.segments();

    let downsample = cli
        .downsample
        .unwrap_or_else(|| settings::get_parsed(store.as_ref(), settings::DOWNSAMPLE, settings::DEFAULT_DOWNSAMPLE));
    if let Some(dir) = &cli.output {
        std::fs::create_dir_all(dir).with_context(|| format!("failed to create {:?}", dir))?;
    }

    let (progress_tx, progress_rx) = unbounded();
    let (result_tx, result_rx) = unbounded();
    let mut grid = ResultsGrid::default();
    let mut analyser = Analyser::new(Arc::new(ResonatorBank), progress_tx).with_progress_increment(cli.progress_increment);
    let samples: Arc<[f32]> = samples.into();
    let total = analyser.set_params(
        samples,
        sample_rate,
        &params,
        &segments,
        downsample,
        cli.output.as_deref(),
        &mut grid,
    )?;
    println!("Analysing {} segment(s), {} output samples", segments.len(), total);

    let worker = thread::spawn(move || {
        let mut sink = ForwardingSink::new(result_tx);
        analyser.start(&mut sink)
    });

    let mut done = 0;
    let mut last_percent = 0;
    let mut finished = false;
    for event in progress_rx.iter() {
        match event {
            AnalysisEvent::Progress(n) => {
                done += n;
                let percent = if total == 0 { 100 } else { (done * 100 / total).min(100) };
                if percent >= last_percent + 10 {
                    last_percent = percent;
                    info!("{}% done", percent);
                }
            }
            AnalysisEvent::Finished => {
                finished = true;
                break;
            }
        }
    }

    match worker.join() {
        Ok(result) => result?,
        Err(_) => bail!("analysis thread panicked"),
    }
    if !finished {
        bail!("analysis stopped before every segment finished");
    }

    for (slot, matrix) in result_rx.try_iter() {
        grid.add_data(slot, matrix)?;
    }
    for plot in grid.slots() {
        let Some(data) = &plot.data else {
            continue;
        };
        let strongest = data
            .traces
            .iter()
            .map(|t| (t, t.values.iter().copied().fold(0.0f64, f64::max)))
            .max_by(|a, b| a.1.total_cmp(&b.1));
        match strongest {
            Some((trace, peak)) => println!("{}: strongest {} (peak {:.4})", plot.title, trace.name, peak),
            None => println!("{}: no channels", plot.title),
        }
    }
    if let Some(dir) = &cli.output {
        println!("Results written to {:?}", dir);
    }
    Ok(())
}
