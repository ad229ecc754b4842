//! Segment registry: keeps the timeline and the segment list describing the
//! same set of segments.
//!
//! Both views store segments in display (insertion) order and share indices.
//! Consumers get the segments sorted by start time through
//! [`SegmentRegistry::segments`]; that order is the one handed to the analyser.

use log::{debug, info, warn};
use uuid::Uuid;

use crate::segment::Segment;
use crate::{Color, SEGMENT_PALETTE};

/// A user gesture from either view.
#[derive(Clone, Debug, PartialEq)]
pub enum SegmentRequest {
    Add { start: Option<f64>, stop: Option<f64> },
    Remove(usize),
    RemoveAll,
    SetRange {
        index: usize,
        start: Option<f64>,
        stop: Option<f64>,
    },
}

/// Value change emitted by a list row.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RangeChange {
    Start(usize, f64),
    Stop(usize, f64),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Region {
    pub start: f64,
    pub stop: f64,
    pub color: Color,
    pub id: Uuid,
}

impl Region {
    fn set_start(&mut self, value: f64) {
        if value > self.stop {
            self.stop = value;
        }
        self.start = value;
    }

    fn set_stop(&mut self, value: f64) {
        if value < self.start {
            self.start = value;
        }
        self.stop = value;
    }
}

/// Waveform view with one draggable region per segment.
#[derive(Default, Debug)]
pub struct Timeline {
    regions: Vec<Region>,
}

impl Timeline {
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Index of the first region containing time `t`.
    pub fn segment_at(&self, t: f64) -> Option<usize> {
        self.regions
            .iter()
            .position(|r| r.start <= t && t <= r.stop)
    }

    /// Index the delete gesture may remove at time `t`. The first region is never offered.
    pub fn removal_target(&self, t: f64) -> Option<usize> {
        self.segment_at(t).filter(|&idx| idx > 0)
    }

    fn add(&mut self, region: Region) {
        self.regions.push(region);
    }

    fn remove(&mut self, idx: usize) -> Region {
        self.regions.remove(idx)
    }

    fn set_range(&mut self, idx: usize, start: Option<f64>, stop: Option<f64>) {
        let region = &mut self.regions[idx];
        if let Some(start) = start {
            region.set_start(start);
        }
        if let Some(stop) = stop {
            region.set_stop(stop);
        }
    }
}

/// One row of the segment list: a pair of bounded start/stop editors.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentRow {
    pub start: f64,
    pub stop: f64,
    pub color: Color,
    pub id: Uuid,
    pub minimum: f64,
    pub maximum: Option<f64>,
}

impl SegmentRow {
    fn clamp(&self, value: f64) -> f64 {
        let value = value.max(self.minimum);
        match self.maximum {
            Some(max) => value.min(max),
            None => value,
        }
    }

    /// Set start, pulling stop forward if needed. Returns the emitted changes.
    pub fn set_start(&mut self, idx: usize, value: f64) -> Vec<RangeChange> {
        let value = self.clamp(value);
        let mut changes = Vec::new();
        if value > self.stop {
            self.stop = value;
            changes.push(RangeChange::Stop(idx, value));
        }
        self.start = value;
        changes.push(RangeChange::Start(idx, value));
        changes
    }

    /// Set stop, pulling start back if needed. Returns the emitted changes.
    pub fn set_stop(&mut self, idx: usize, value: f64) -> Vec<RangeChange> {
        let value = self.clamp(value);
        let mut changes = Vec::new();
        if value < self.start {
            self.start = value;
            changes.push(RangeChange::Start(idx, value));
        }
        self.stop = value;
        changes.push(RangeChange::Stop(idx, value));
        changes
    }
}

/// Scrollable list of segment rows. Rows after the first carry a remove button.
#[derive(Default, Debug)]
pub struct SegmentList {
    rows: Vec<SegmentRow>,
    minimum: f64,
    maximum: Option<f64>,
}

impl SegmentList {
    pub fn rows(&self) -> &[SegmentRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn is_removable(&self, idx: usize) -> bool {
        idx > 0 && idx < self.rows.len()
    }

    pub fn set_maximum(&mut self, value: f64) {
        self.maximum = Some(value);
        for row in &mut self.rows {
            row.maximum = Some(value);
        }
    }

    fn add(&mut self, start: f64, stop: f64, color: Color, id: Uuid) {
        self.rows.push(SegmentRow {
            start,
            stop,
            color,
            id,
            minimum: self.minimum,
            maximum: self.maximum,
        });
    }

    fn remove(&mut self, idx: usize) -> SegmentRow {
        self.rows.remove(idx)
    }

    fn set_range(&mut self, idx: usize, start: Option<f64>, stop: Option<f64>) -> Vec<RangeChange> {
        let row = &mut self.rows[idx];
        let mut changes = Vec::new();
        if let Some(start) = start {
            changes.extend(row.set_start(idx, start));
        }
        if let Some(stop) = stop {
            changes.extend(row.set_stop(idx, stop));
        }
        changes
    }
}

/// Owns both segment views and the segment colour cycle.
#[derive(Debug)]
pub struct SegmentRegistry {
    timeline: Timeline,
    list: SegmentList,
    palette_pos: usize,
    duration: f64,
    sample_rate: Option<u32>,
    status: Option<String>,
}

impl Default for SegmentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentRegistry {
    /// Registry with a single default segment `[0, 1]` and no audio.
    pub fn new() -> Self {
        let mut registry = Self {
            timeline: Timeline::default(),
            list: SegmentList::default(),
            palette_pos: 0,
            duration: 1.0,
            sample_rate: None,
            status: None,
        };
        registry.add_segment(Some(0.0), Some(registry.duration));
        registry
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn list(&self) -> &SegmentList {
        &self.list
    }

    pub fn len(&self) -> usize {
        self.timeline.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timeline.is_empty()
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.sample_rate
    }

    /// Most recent status-bar message, if any.
    pub fn take_status(&mut self) -> Option<String> {
        self.status.take()
    }

    /// Attach new audio: update bounds and reset to one segment covering the buffer.
    pub fn set_audio(&mut self, sample_count: usize, sample_rate: u32) {
        self.sample_rate = Some(sample_rate);
        self.duration = sample_count as f64 / sample_rate as f64;
        self.list.set_maximum(self.duration);
        self.remove_all_segments();
    }

    fn next_color(&mut self) -> Color {
        let color = SEGMENT_PALETTE[self.palette_pos % SEGMENT_PALETTE.len()];
        self.palette_pos += 1;
        color
    }

    fn clamp_time(&self, t: f64) -> f64 {
        let t = t.max(0.0);
        match self.list.maximum {
            Some(max) => t.min(max),
            None => t,
        }
    }

    pub fn handle(&mut self, request: SegmentRequest) -> Vec<RangeChange> {
        match request {
            SegmentRequest::Add { start, stop } => {
                self.add_segment(start, stop);
                Vec::new()
            }
            SegmentRequest::Remove(idx) => {
                self.remove_segment(idx);
                Vec::new()
            }
            SegmentRequest::RemoveAll => {
                self.remove_all_segments();
                Vec::new()
            }
            SegmentRequest::SetRange { index, start, stop } => {
                self.set_segment_range(index, start, stop)
            }
        }
    }

    /// Add a segment to both views.
    ///
    /// Without `start`, the new segment chains after the latest stop time
    /// (clamped to the audio duration). Without `stop`, it lasts one second.
    pub fn add_segment(&mut self, start: Option<f64>, stop: Option<f64>) {
        let start = match start {
            Some(t) => t,
            None => self
                .timeline
                .regions()
                .iter()
                .map(|r| r.stop)
                .reduce(f64::max)
                .map(|t| t.min(self.duration))
                .unwrap_or(0.0),
        };
        let stop = stop.unwrap_or(start + 1.0);

        let start = self.clamp_time(start);
        let stop = self.clamp_time(stop).max(start);

        let color = self.next_color();
        let id = Uuid::new_v4();
        self.timeline.add(Region { start, stop, color, id });
        self.list.add(start, stop, color, id);

        info!("Segment added: {:.4}-{:.4}s", start, stop);
        self.status = Some(format!("New segment added at {start}s"));
    }

    /// Remove segment `idx` from both views. The sole remaining segment is kept.
    pub fn remove_segment(&mut self, idx: usize) -> bool {
        assert!(idx < self.len(), "segment index {idx} out of range ({} segments)", self.len());
        if self.len() == 1 {
            warn!("Refusing to remove the only segment");
            return false;
        }
        let region = self.timeline.remove(idx);
        let row = self.list.remove(idx);
        debug_assert_eq!(region.id, row.id);
        info!("Segment {} removed", idx);
        self.status = Some("Segment removed".to_string());
        true
    }

    /// Timeline delete gesture at time `t`.
    pub fn delete_at(&mut self, t: f64) -> bool {
        match self.timeline.removal_target(t) {
            Some(idx) => self.remove_segment(idx),
            None => {
                self.status = Some("Cannot remove first region".to_string());
                false
            }
        }
    }

    /// Drop every segment and recreate the default one covering the whole buffer.
    pub fn remove_all_segments(&mut self) {
        self.timeline = Timeline::default();
        let maximum = self.list.maximum;
        self.list = SegmentList {
            rows: Vec::new(),
            minimum: 0.0,
            maximum,
        };
        self.palette_pos = 0;
        self.add_segment(Some(0.0), Some(self.duration));
        debug!("All segments reset to 0-{}s", self.duration);
    }

    /// Push a range change into both views.
    ///
    /// Returns the changes the list emitted. They are reported, not fed back
    /// into the timeline, so an edit never re-enters the view it came from.
    pub fn set_segment_range(
        &mut self,
        idx: usize,
        start: Option<f64>,
        stop: Option<f64>,
    ) -> Vec<RangeChange> {
        assert!(idx < self.len(), "segment index {idx} out of range ({} segments)", self.len());
        let start = start.map(|t| self.clamp_time(t));
        let stop = stop.map(|t| self.clamp_time(t));
        self.timeline.set_range(idx, start, stop);
        self.list.set_range(idx, start, stop)
    }

    /// Segments sorted by ascending start time.
    pub fn segments(&self) -> Vec<Segment> {
        let mut regions: Vec<&Region> = self.timeline.regions().iter().collect();
        regions.sort_by(|a, b| a.start.total_cmp(&b.start));
        regions
            .into_iter()
            .map(|r| Segment {
                start: r.start,
                stop: r.stop,
                sample_rate: self.sample_rate,
                color: r.color,
                id: r.id,
            })
            .collect()
    }

    /// True when both views hold the same segments in the same order.
    pub fn is_consistent(&self) -> bool {
        self.timeline.len() == self.list.len()
            && self
                .timeline
                .regions()
                .iter()
                .zip(self.list.rows())
                .all(|(r, row)| {
                    r.id == row.id && r.color == row.color && r.start == row.start && r.stop == row.stop
                })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded(seconds: usize) -> SegmentRegistry {
        let mut reg = SegmentRegistry::new();
        reg.set_audio(seconds * 48000, 48000);
        reg
    }

    #[test]
    fn test_new_registry_has_default_segment() {
        let reg = SegmentRegistry::new();
        assert_eq!(reg.len(), 1);
        let segs = reg.segments();
        assert_eq!(segs[0].time(), (0.0, 1.0));
        assert_eq!(segs[0].sample_rate, None);
        assert!(reg.is_consistent());
    }

    #[test]
    fn test_set_audio_resets_to_whole_buffer() {
        let reg = loaded(10);
        let segs = reg.segments();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].time(), (0.0, 10.0));
        assert_eq!(segs[0].samples(), Some((0, 480000)));
    }

    #[test]
    fn test_add_chains_after_last_stop() {
        let mut reg = loaded(10);
        reg.set_segment_range(0, Some(0.0), Some(2.0));
        reg.add_segment(None, None);
        reg.add_segment(None, None);
        let segs = reg.segments();
        assert_eq!(segs.len(), 3);
        assert_eq!(segs[1].time(), (2.0, 3.0));
        assert_eq!(segs[2].time(), (3.0, 4.0));
        assert!(reg.is_consistent());
    }

    #[test]
    fn test_add_clamps_start_to_duration() {
        let mut reg = loaded(4);
        reg.add_segment(None, None);
        let segs = reg.segments();
        assert_eq!(segs[1].time(), (4.0, 4.0));
    }

    #[test]
    fn test_colors_cycle_through_palette() {
        let mut reg = loaded(100);
        for _ in 0..9 {
            reg.add_segment(None, None);
        }
        let rows = reg.list().rows();
        assert_eq!(rows[0].color, SEGMENT_PALETTE[0]);
        assert_eq!(rows[7].color, SEGMENT_PALETTE[7]);
        assert_eq!(rows[8].color, SEGMENT_PALETTE[0]);
        assert_eq!(rows[9].color, SEGMENT_PALETTE[1]);
    }

    #[test]
    fn test_remove_all_leaves_one_default_segment() {
        let mut reg = loaded(7);
        reg.add_segment(Some(1.0), Some(2.0));
        reg.add_segment(Some(3.0), Some(5.0));
        reg.remove_all_segments();
        let segs = reg.segments();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].start, 0.0);
        assert_eq!(segs[0].stop, 7.0);
        assert_eq!(segs[0].color, SEGMENT_PALETTE[0]);
        assert!(reg.is_consistent());
    }

    #[test]
    fn test_remove_by_index_in_both_views() {
        let mut reg = loaded(10);
        reg.add_segment(Some(1.0), Some(2.0));
        reg.add_segment(Some(3.0), Some(4.0));
        let removed_id = reg.list().rows()[1].id;
        assert!(reg.remove_segment(1));
        assert_eq!(reg.len(), 2);
        assert!(reg.timeline().regions().iter().all(|r| r.id != removed_id));
        assert!(reg.is_consistent());
    }

    #[test]
    fn test_sole_segment_not_removable() {
        let mut reg = loaded(3);
        assert!(!reg.remove_segment(0));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    #[should_panic]
    fn test_out_of_range_index_panics() {
        let mut reg = loaded(3);
        reg.set_segment_range(5, Some(1.0), None);
    }

    #[test]
    fn test_delete_gesture_skips_first_region() {
        let mut reg = loaded(10);
        reg.set_segment_range(0, None, Some(2.0));
        reg.add_segment(Some(5.0), Some(6.0));
        assert!(!reg.delete_at(1.0));
        assert_eq!(reg.take_status().as_deref(), Some("Cannot remove first region"));
        assert!(reg.delete_at(5.5));
        assert_eq!(reg.len(), 1);
        assert!(!reg.delete_at(8.0));
    }

    #[test]
    fn test_start_past_stop_moves_both() {
        let mut reg = loaded(10);
        reg.add_segment(Some(2.0), Some(3.0));
        let changes = reg.set_segment_range(1, Some(5.0), None);
        assert_eq!(changes, vec![RangeChange::Stop(1, 5.0), RangeChange::Start(1, 5.0)]);
        let row = &reg.list().rows()[1];
        assert_eq!((row.start, row.stop), (5.0, 5.0));
        assert!(reg.is_consistent());
    }

    #[test]
    fn test_stop_before_start_moves_both() {
        let mut reg = loaded(10);
        reg.add_segment(Some(4.0), Some(6.0));
        let changes = reg.set_segment_range(1, None, Some(1.5));
        assert_eq!(changes, vec![RangeChange::Start(1, 1.5), RangeChange::Stop(1, 1.5)]);
        assert!(reg.is_consistent());
    }

    #[test]
    fn test_range_clamped_to_audio() {
        let mut reg = loaded(5);
        reg.set_segment_range(0, Some(-1.0), Some(9.0));
        assert_eq!(reg.segments()[0].time(), (0.0, 5.0));
    }

    #[test]
    fn test_segments_sorted_by_start() {
        let mut reg = loaded(20);
        reg.set_segment_range(0, Some(10.0), Some(12.0));
        reg.add_segment(Some(1.0), Some(2.0));
        reg.add_segment(Some(5.0), Some(6.0));
        let starts: Vec<f64> = reg.segments().iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![1.0, 5.0, 10.0]);
        // display order is untouched
        assert_eq!(reg.timeline().regions()[0].start, 10.0);
    }

    #[test]
    fn test_segment_ids_stable_across_calls() {
        let mut reg = loaded(20);
        reg.add_segment(Some(1.0), Some(2.0));
        let a = reg.segments();
        let b = reg.segments();
        assert_eq!(a, b);
    }

    #[test]
    fn test_handle_dispatches_requests() {
        let mut reg = loaded(10);
        reg.handle(SegmentRequest::Add { start: Some(2.0), stop: None });
        assert_eq!(reg.segments()[1].time(), (2.0, 3.0));
        let changes = reg.handle(SegmentRequest::SetRange { index: 1, start: None, stop: Some(4.0) });
        assert_eq!(changes, vec![RangeChange::Stop(1, 4.0)]);
        reg.handle(SegmentRequest::Remove(1));
        assert_eq!(reg.len(), 1);
        reg.handle(SegmentRequest::RemoveAll);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_first_row_has_no_remove_button() {
        let mut reg = loaded(10);
        reg.add_segment(None, None);
        assert!(!reg.list().is_removable(0));
        assert!(reg.list().is_removable(1));
    }
}
