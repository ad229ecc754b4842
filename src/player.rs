use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};

/// Mono source over one segment of a shared buffer.
pub struct SegmentSource {
    audio: Arc<[f32]>,
    sample_rate: u32,
    start: usize,
    end: usize,
    cursor: usize,
    looping: bool,
}

impl SegmentSource {
    /// `start..end` is clamped to the buffer.
    pub fn new(audio: Arc<[f32]>, sample_rate: u32, (start, end): (usize, usize), looping: bool) -> Self {
        let end = end.min(audio.len());
        let start = start.min(end);
        Self {
            audio,
            sample_rate,
            start,
            end,
            cursor: start,
            looping,
        }
    }

    pub fn range(&self) -> (usize, usize) {
        (self.start, self.end)
    }
}

impl Iterator for SegmentSource {
    type Item = f32;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.end {
            if !self.looping || self.start == self.end {
                return None;
            }
            self.cursor = self.start;
        }
        let sample = self.audio[self.cursor];
        self.cursor += 1;
        Some(sample)
    }
}

impl Source for SegmentSource {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        if self.looping {
            return None;
        }
        let secs = (self.end - self.start) as f64 / self.sample_rate.max(1) as f64;
        Some(Duration::from_secs_f64(secs))
    }
}

/// Plays one segment at a time; starting another stops the current one.
pub struct SegmentPlayer {
    _stream: OutputStream,
    handle: OutputStreamHandle,
    sink: Option<Sink>,
    volume: f32,
}

impl SegmentPlayer {
    pub fn new() -> Result<Self> {
        let (stream, handle) = OutputStream::try_default().context("no audio output device")?;
        Ok(Self {
            _stream: stream,
            handle,
            sink: None,
            volume: 1.0,
        })
    }

    pub fn play(&mut self, source: SegmentSource) -> Result<()> {
        self.stop();
        let sink = Sink::try_new(&self.handle).context("failed to open audio sink")?;
        info!("Playing samples {:?}", source.range());
        sink.set_volume(self.volume);
        sink.append(source);
        sink.play();
        self.sink = Some(sink);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
    }

    pub fn is_playing(&self) -> bool {
        self.sink.as_ref().is_some_and(|s| !s.empty() && !s.is_paused())
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume;
        if let Some(sink) = &self.sink {
            sink.set_volume(volume);
        }
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Arc<[f32]> {
        (0..n).map(|i| i as f32).collect::<Vec<f32>>().into()
    }

    #[test]
    fn test_segment_source_is_clamped() {
        let src = SegmentSource::new(ramp(10), 8000, (7, 100), false);
        assert_eq!(src.range(), (7, 10));
        let samples: Vec<f32> = src.collect();
        assert_eq!(samples, vec![7.0, 8.0, 9.0]);

        let src = SegmentSource::new(ramp(10), 8000, (20, 30), false);
        assert_eq!(src.count(), 0);
    }

    #[test]
    fn test_looping_source_wraps() {
        let src = SegmentSource::new(ramp(10), 8000, (2, 4), true);
        assert_eq!(src.total_duration(), None);
        let samples: Vec<f32> = src.take(5).collect();
        assert_eq!(samples, vec![2.0, 3.0, 2.0, 3.0, 2.0]);
    }

    #[test]
    fn test_duration() {
        let src = SegmentSource::new(ramp(16000), 8000, (0, 16000), false);
        assert_eq!(src.total_duration(), Some(Duration::from_secs(2)));
        assert_eq!(src.channels(), 1);
    }
}
