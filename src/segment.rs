use uuid::Uuid;

use crate::Color;

/// A time range of the loaded audio, selected for independent analysis.
///
/// Times are in seconds. The sample range is only known once a sample rate
/// has been attached (i.e. once audio has been loaded).
#[derive(Clone, Debug, PartialEq)]
pub struct Segment {
    pub start: f64,
    pub stop: f64,
    pub sample_rate: Option<u32>,
    pub color: Color,
    pub id: Uuid,
}

impl Segment {
    pub fn new(start: f64, stop: f64, sample_rate: Option<u32>, color: Color) -> Self {
        assert!(start <= stop, "segment start {start} is after stop {stop}");
        Self {
            start,
            stop,
            sample_rate,
            color,
            id: Uuid::new_v4(),
        }
    }

    pub fn time(&self) -> (f64, f64) {
        (self.start, self.stop)
    }

    pub fn duration(&self) -> f64 {
        self.stop - self.start
    }

    /// `(floor(start * sr), floor(stop * sr))`, or `None` before a sample rate is set.
    pub fn samples(&self) -> Option<(usize, usize)> {
        let sr = self.sample_rate? as f64;
        let to_sample = |t: f64| (t * sr).floor().max(0.0) as usize;
        Some((to_sample(self.start), to_sample(self.stop)))
    }

    pub fn contains(&self, t: f64) -> bool {
        self.start <= t && t <= self.stop
    }
}
