//! Segment analysis: one task per segment, run in sequence by the `Analyser`.
//!
//! Tasks are plain sequential units of work. The engine parallelises across
//! channels internally, so the analyser itself never runs two tasks at once.
//! Callers wanting a responsive UI move the whole analyser to one background
//! thread; plot slots are allocated before that, on the owning thread.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use log::{debug, info, warn};

use crate::engine::{DetectorEngine, ResponseCache};
use crate::error::SetupError;
use crate::export;
use crate::params::DetectorParams;
use crate::segment::Segment;

/// Cache block length in milliseconds.
pub const CACHE_BLOCK_MS: usize = 30;
/// Blocks held in flight by each task's cache.
pub const CACHE_BLOCK_COUNT: usize = 10;

/// Channel x column matrix of detector responses.
#[derive(Clone, Debug, PartialEq)]
pub struct ResponseMatrix {
    channels: usize,
    columns: usize,
    data: Vec<f64>,
}

impl ResponseMatrix {
    pub fn zeros(channels: usize, columns: usize) -> Self {
        Self {
            channels,
            columns,
            data: vec![0.0; channels * columns],
        }
    }

    pub fn from_rows(rows: Vec<Vec<f64>>) -> Self {
        let channels = rows.len();
        let columns = rows.first().map_or(0, Vec::len);
        assert!(rows.iter().all(|r| r.len() == columns), "ragged rows");
        Self {
            channels,
            columns,
            data: rows.into_iter().flatten().collect(),
        }
    }

    /// `(channels, columns)`
    pub fn shape(&self) -> (usize, usize) {
        (self.channels, self.columns)
    }

    pub fn get(&self, channel: usize, column: usize) -> f64 {
        self.data[channel * self.columns + column]
    }

    pub fn set(&mut self, channel: usize, column: usize, value: f64) {
        self.data[channel * self.columns + column] = value;
    }

    pub fn row(&self, channel: usize) -> &[f64] {
        &self.data[channel * self.columns..(channel + 1) * self.columns]
    }

    pub fn rows(&self) -> impl Iterator<Item = &[f64]> {
        (0..self.channels).map(move |k| self.row(k))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnalysisEvent {
    /// Number of output columns produced since the last progress event
    Progress(usize),
    /// Every task has delivered its result
    Finished,
}

/// Receives plot slots before a run starts.
pub trait PlotAllocator {
    /// One new slot per segment, in the order given.
    fn add_plots(&mut self, freqs: &[f64], segments: &[Segment]) -> Vec<usize>;
}

/// Receives each task's result.
pub trait ResultSink {
    fn add_data(&mut self, slot: usize, data: ResponseMatrix) -> Result<()>;
}

/// Result sink that forwards results to another thread.
pub struct ForwardingSink {
    tx: Sender<(usize, ResponseMatrix)>,
}

impl ForwardingSink {
    pub fn new(tx: Sender<(usize, ResponseMatrix)>) -> Self {
        Self { tx }
    }
}

impl ResultSink for ForwardingSink {
    fn add_data(&mut self, slot: usize, data: ResponseMatrix) -> Result<()> {
        self.tx
            .send((slot, data))
            .map_err(|_| anyhow::anyhow!("result receiver for slot {} has gone away", slot))
    }
}

/// Detector response of one segment.
pub struct AnalysisTask {
    slot: usize,
    n0: usize,
    n1: usize,
    downsample: usize,
    progress_increment: usize,
    channels: usize,
    cache: Box<dyn ResponseCache>,
    output: Option<PathBuf>,
}

impl AnalysisTask {
    /// Build the detector and cache for samples `n0..n1` of `audio`.
    ///
    /// The range is clamped to the buffer.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: &dyn DetectorEngine,
        audio: Arc<[f32]>,
        sample_rate: u32,
        params: &DetectorParams,
        slot: usize,
        (n0, n1): (usize, usize),
        downsample: usize,
        progress_increment: usize,
    ) -> Result<Self> {
        let n1 = n1.min(audio.len());
        let n0 = n0.min(n1);
        let downsample = downsample.max(1);

        let detector = engine
            .build_detector(sample_rate, audio, n0..n1, params)
            .with_context(|| format!("failed to build detector for samples {}-{}", n0, n1))?;
        let channels = detector.channel_count();
        let block_size = (CACHE_BLOCK_MS * sample_rate as usize / 1000).max(1);
        let cache = detector.into_cache(CACHE_BLOCK_COUNT, block_size)?;

        Ok(Self {
            slot,
            n0,
            n1,
            downsample,
            progress_increment: progress_increment.max(1),
            channels,
            cache,
            output: None,
        })
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn samples(&self) -> (usize, usize) {
        (self.n0, self.n1)
    }

    /// Output columns: `(n1 - n0) / downsample`, rounded down.
    pub fn columns(&self) -> usize {
        (self.n1 - self.n0) / self.downsample
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn set_output(&mut self, path: Option<PathBuf>) {
        self.output = path;
    }

    pub fn output(&self) -> Option<&Path> {
        self.output.as_deref()
    }

    /// Read every `downsample`th sample of every channel.
    ///
    /// `progress` is called with `progress_increment` after each group of that
    /// many columns.
    pub fn run(&mut self, progress: &mut dyn FnMut(usize)) -> Result<ResponseMatrix> {
        let columns = self.columns();
        let mut result = ResponseMatrix::zeros(self.channels, columns);
        let end = self.cache.end();

        let (mut n, mut idx) = (0, 0);
        while n < end && idx < columns {
            for k in 0..self.channels {
                result.set(k, idx, self.cache.get(k, n)?);
            }
            idx += 1;
            n += self.downsample;
            if idx % self.progress_increment == 0 {
                progress(self.progress_increment);
            }
        }

        if idx < columns {
            warn!(
                "Slot {}: cache ended after {} of {} columns",
                self.slot, idx, columns
            );
        }
        Ok(result)
    }
}

/// Runs one task per segment and routes each result to its plot slot.
pub struct Analyser {
    engine: Arc<dyn DetectorEngine>,
    events: Sender<AnalysisEvent>,
    progress_increment: usize,
    tasks: Vec<AnalysisTask>,
    expected: usize,
    completed: Vec<usize>,
    finished_sent: bool,
}

impl Analyser {
    pub fn new(engine: Arc<dyn DetectorEngine>, events: Sender<AnalysisEvent>) -> Self {
        Self {
            engine,
            events,
            progress_increment: 1,
            tasks: Vec::new(),
            expected: 0,
            completed: Vec::new(),
            finished_sent: false,
        }
    }

    pub fn with_progress_increment(mut self, increment: usize) -> Self {
        self.progress_increment = increment.max(1);
        self
    }

    pub fn tasks(&self) -> &[AnalysisTask] {
        &self.tasks
    }

    /// Slots that have received their result in this run.
    pub fn completed(&self) -> &[usize] {
        &self.completed
    }

    /// Prepare a run: build a task and allocate a plot slot for each segment.
    ///
    /// Returns the number of output columns the run will produce, for sizing
    /// a progress bar. With `save_dir`, the detector table and every segment's
    /// result are also written there as CSV.
    #[allow(clippy::too_many_arguments)]
    pub fn set_params(
        &mut self,
        audio: Arc<[f32]>,
        sample_rate: u32,
        params: &DetectorParams,
        segments: &[Segment],
        downsample: usize,
        save_dir: Option<&Path>,
        plots: &mut dyn PlotAllocator,
    ) -> Result<usize> {
        self.tasks.clear();
        if downsample == 0 {
            return Err(SetupError::InvalidDownsample.into());
        }
        if segments.is_empty() {
            return Err(SetupError::NoSegments.into());
        }
        if audio.is_empty() {
            return Err(SetupError::MissingAudio.into());
        }
        params.validate()?;

        // build every task before touching the plots, so a failure leaves no slots behind
        let mut tasks = Vec::with_capacity(segments.len());
        let mut total = 0;
        for segment in segments {
            let task = AnalysisTask::new(
                &*self.engine,
                audio.clone(),
                sample_rate,
                params,
                0,
                sample_bounds(segment, sample_rate),
                downsample,
                self.progress_increment,
            )?;
            let (n0, n1) = task.samples();
            total += n1 - n0;
            tasks.push(task);
        }

        if let Some(dir) = save_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create output directory {:?}", dir))?;
            export::write_detector_chars(dir.join(export::DETECTOR_CHARS_FILE), &params.det_chars)?;
        }

        let slots = plots.add_plots(&params.frequencies(), segments);
        assert_eq!(slots.len(), segments.len(), "allocator returned wrong number of slots");

        for (task, &slot) in tasks.iter_mut().zip(&slots) {
            let (n0, n1) = task.samples();
            task.slot = slot;
            if let Some(dir) = save_dir {
                task.set_output(Some(dir.join(export::segment_file_name(n0, n1))));
            }
            debug!("Slot {} bound to samples {}-{}", slot, n0, n1);
        }
        self.tasks = tasks;
        let total = total / downsample;

        self.expected = self.tasks.len();
        self.completed.clear();
        self.finished_sent = false;

        info!(
            "Prepared {} segment(s), {} output samples, downsample {}",
            self.expected, total, downsample
        );
        Ok(total)
    }

    /// Run every prepared task in order.
    ///
    /// The first failing task aborts the run: its error is returned, later
    /// tasks are not run and `Finished` is not sent.
    pub fn start(&mut self, sink: &mut dyn ResultSink) -> Result<()> {
        let tasks = std::mem::take(&mut self.tasks);
        for mut task in tasks {
            let slot = task.slot();
            let events = self.events.clone();
            info!("Analysing slot {} (samples {:?})", slot, task.samples());
            let result = task
                .run(&mut |inc| {
                    events.send(AnalysisEvent::Progress(inc)).ok();
                })
                .with_context(|| format!("analysis of slot {} failed", slot))?;
            let output = task.output().map(Path::to_path_buf);
            drop(task);
            self.task_finished(slot, result, output.as_deref(), sink)?;
        }
        Ok(())
    }

    fn task_finished(
        &mut self,
        slot: usize,
        result: ResponseMatrix,
        output: Option<&Path>,
        sink: &mut dyn ResultSink,
    ) -> Result<()> {
        if let Some(path) = output {
            export::write_matrix(path, &result)?;
        }
        sink.add_data(slot, result)?;
        self.completed.push(slot);

        if self.completed.len() == self.expected && !self.finished_sent {
            self.finished_sent = true;
            info!("All {} segment(s) analysed", self.expected);
            self.events.send(AnalysisEvent::Finished).ok();
        }
        Ok(())
    }
}

/// Sample range of `segment`, using `sample_rate` if the segment has none.
fn sample_bounds(segment: &Segment, sample_rate: u32) -> (usize, usize) {
    match segment.samples() {
        Some(bounds) => bounds,
        None => {
            let sr = sample_rate as f64;
            let to_sample = |t: f64| (t * sr).floor().max(0.0) as usize;
            (to_sample(segment.start), to_sample(segment.stop))
        }
    }
}
