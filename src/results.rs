//! Paginated grid of result plots.
//!
//! Slots are appended in allocation order and never reordered, so a slot index
//! handed out by `add_plots` stays valid until `clear`. Placement on the grid
//! is derived from the index and the current dimensions.

use anyhow::{bail, Result};
use log::{debug, info};

use crate::analysis::{PlotAllocator, ResponseMatrix, ResultSink};
use crate::segment::Segment;
use crate::{Color, PLOT_PALETTE};

pub const DEFAULT_ROWS: usize = 2;
pub const DEFAULT_COLS: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    pub page: usize,
    pub row: usize,
    pub col: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Trace {
    pub name: String,
    pub color: Color,
    pub values: Vec<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlotData {
    /// Seconds from the start of the file
    pub time: Vec<f64>,
    pub traces: Vec<Trace>,
}

#[derive(Clone, Debug)]
pub struct PlotSlot {
    pub segment: Segment,
    pub freqs: Vec<f64>,
    pub title: String,
    pub data: Option<PlotData>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LegendEntry {
    pub label: String,
    pub color: Color,
    pub highlighted: bool,
}

/// One entry per channel. At most one entry is highlighted.
#[derive(Clone, Debug, Default)]
pub struct Legend {
    entries: Vec<LegendEntry>,
}

impl Legend {
    pub fn from_freqs(freqs: &[f64]) -> Self {
        let entries = freqs
            .iter()
            .enumerate()
            .map(|(k, &f)| LegendEntry {
                label: channel_label(f),
                color: trace_color(k),
                highlighted: false,
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[LegendEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highlight `channel`, un-highlighting any other. `None` clears it.
    pub fn highlight(&mut self, channel: Option<usize>) {
        for (k, entry) in self.entries.iter_mut().enumerate() {
            entry.highlighted = Some(k) == channel;
        }
    }

    pub fn highlighted(&self) -> Option<usize> {
        self.entries.iter().position(|e| e.highlighted)
    }
}

pub struct ResultsGrid {
    slots: Vec<PlotSlot>,
    rows: usize,
    cols: usize,
    page: usize,
    legend: Legend,
}

impl Default for ResultsGrid {
    fn default() -> Self {
        Self::new(DEFAULT_ROWS, DEFAULT_COLS)
    }
}

impl ResultsGrid {
    pub fn new(rows: usize, cols: usize) -> Self {
        assert!(rows > 0 && cols > 0, "grid needs at least one cell");
        Self {
            slots: Vec::new(),
            rows,
            cols,
            page: 0,
            legend: Legend::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, idx: usize) -> &PlotSlot {
        &self.slots[idx]
    }

    pub fn slots(&self) -> &[PlotSlot] {
        &self.slots
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn legend(&self) -> &Legend {
        &self.legend
    }

    pub fn legend_mut(&mut self) -> &mut Legend {
        &mut self.legend
    }

    fn page_size(&self) -> usize {
        self.rows * self.cols
    }

    pub fn page_count(&self) -> usize {
        self.slots.len().div_ceil(self.page_size())
    }

    /// Current page index. Meaningless while the grid is empty.
    pub fn current_page(&self) -> usize {
        self.page
    }

    /// `"Page i/n"`, one-based; `"Page 0/0"` when there is nothing to show.
    pub fn page_label(&self) -> String {
        match self.page_count() {
            0 => "Page 0/0".to_string(),
            n => format!("Page {}/{}", self.page + 1, n),
        }
    }

    pub fn placement(&self, slot: usize) -> Placement {
        let size = self.page_size();
        let within = slot % size;
        Placement {
            page: slot / size,
            row: within / self.cols,
            col: within % self.cols,
        }
    }

    /// Slots on the current page, in grid order.
    pub fn visible(&self) -> impl Iterator<Item = (usize, Placement, &PlotSlot)> {
        let size = self.page_size();
        let start = (self.page * size).min(self.slots.len());
        let stop = (start + size).min(self.slots.len());
        (start..stop).map(move |i| (i, self.placement(i), &self.slots[i]))
    }

    /// Go to page `page` if it exists.
    pub fn set_page(&mut self, page: usize) -> bool {
        if page < self.page_count() {
            self.page = page;
            true
        } else {
            false
        }
    }

    pub fn next_page(&mut self) -> bool {
        self.set_page(self.page + 1)
    }

    pub fn prev_page(&mut self) -> bool {
        match self.page.checked_sub(1) {
            Some(p) => self.set_page(p),
            None => false,
        }
    }

    pub fn has_next(&self) -> bool {
        self.page + 1 < self.page_count()
    }

    pub fn has_prev(&self) -> bool {
        self.page > 0 && self.page_count() > 0
    }

    /// Lay the same slots out on a `rows` x `cols` grid and go to the first page.
    pub fn apply_grid(&mut self, rows: usize, cols: usize) {
        assert!(rows > 0 && cols > 0, "grid needs at least one cell");
        self.rows = rows;
        self.cols = cols;
        self.page = 0;
        info!("Results grid set to {}x{}, {} page(s)", rows, cols, self.page_count());
    }

    /// Drop every slot and the legend.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.legend = Legend::default();
        self.page = 0;
    }

    fn set_data(&mut self, slot: usize, data: ResponseMatrix) -> Result<()> {
        let Some(plot) = self.slots.get_mut(slot) else {
            bail!("no plot slot {}", slot);
        };
        let (channels, columns) = data.shape();
        if channels != plot.freqs.len() {
            bail!(
                "slot {} expects {} channels, result has {}",
                slot,
                plot.freqs.len(),
                channels
            );
        }
        let (t0, t1) = plot.segment.time();
        let traces = data
            .rows()
            .zip(&plot.freqs)
            .enumerate()
            .map(|(k, (row, &f))| Trace {
                name: channel_label(f),
                color: trace_color(k),
                values: row.to_vec(),
            })
            .collect();
        plot.data = Some(PlotData {
            time: linspace(t0, t1, columns),
            traces,
        });
        debug!("Slot {} received {}x{} result", slot, channels, columns);

        self.page = self.placement(slot).page;
        Ok(())
    }
}

impl PlotAllocator for ResultsGrid {
    fn add_plots(&mut self, freqs: &[f64], segments: &[Segment]) -> Vec<usize> {
        if self.legend.is_empty() {
            self.legend = Legend::from_freqs(freqs);
        }
        let first = self.slots.len();
        self.slots.extend(segments.iter().map(|segment| PlotSlot {
            segment: segment.clone(),
            freqs: freqs.to_vec(),
            title: plot_title(segment),
            data: None,
        }));
        (first..self.slots.len()).collect()
    }
}

impl ResultSink for ResultsGrid {
    fn add_data(&mut self, slot: usize, data: ResponseMatrix) -> Result<()> {
        self.set_data(slot, data)
    }
}

pub fn channel_label(freq: f64) -> String {
    format!("{}Hz", trim_float(freq, 6))
}

fn trace_color(channel: usize) -> Color {
    PLOT_PALETTE[channel % PLOT_PALETTE.len()]
}

/// `"0.5-1.25 seconds"`, or the raw bounds when the sample rate is unknown.
pub fn plot_title(segment: &Segment) -> String {
    match segment.samples() {
        Some(_) => format!(
            "{}-{} seconds",
            trim_float(segment.start, 4),
            trim_float(segment.stop, 4)
        ),
        None => format!("{}-{}", segment.start, segment.stop),
    }
}

/// Format `x` like printf `%g` with `sig` significant digits: fixed notation
/// unless the exponent is below -4 or at least `sig`, trailing zeros dropped.
fn trim_float(x: f64, sig: usize) -> String {
    if x == 0.0 || !x.is_finite() {
        return format!("{}", x);
    }
    let sig = sig.max(1);
    // exponent after rounding to `sig` digits
    let sci = format!("{:.*e}", sig - 1, x);
    let Some((mantissa, exp)) = sci.split_once('e') else {
        return sci;
    };
    let exp: i64 = exp.parse().unwrap_or(0);
    if exp < -4 || exp >= sig as i64 {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", trim_zeros(mantissa), sign, exp.abs())
    } else {
        let decimals = (sig as i64 - 1 - exp) as usize;
        trim_zeros(&format!("{:.*}", decimals, x)).to_string()
    }
}

fn trim_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SEGMENT_PALETTE;

    fn segments(n: usize) -> Vec<Segment> {
        (0..n)
            .map(|i| Segment::new(i as f64, i as f64 + 1.0, Some(1000), SEGMENT_PALETTE[i % 8]))
            .collect()
    }

    #[test]
    fn test_pagination_arithmetic() {
        let mut grid = ResultsGrid::new(2, 2);
        assert_eq!(grid.page_count(), 0);
        assert_eq!(grid.page_label(), "Page 0/0");

        // ceil(6 / 4)
        let slots = grid.add_plots(&[100.0, 200.0], &segments(6));
        assert_eq!(slots, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(grid.page_count(), 2);
        assert_eq!(grid.page_label(), "Page 1/2");

        grid.apply_grid(1, 1);
        assert_eq!(grid.page_count(), 6);
        assert_eq!(grid.current_page(), 0);

        grid.add_plots(&[100.0, 200.0], &segments(3));
        grid.apply_grid(2, 2);
        assert_eq!(grid.page_count(), 3);
        assert!(grid.set_page(2));
        assert_eq!(grid.page_label(), "Page 3/3");
        assert!(!grid.next_page());

        grid.clear();
        assert_eq!(grid.page_count(), 0);
        assert_eq!(grid.page_label(), "Page 0/0");
        assert!(!grid.next_page());
        assert!(!grid.set_page(0));
    }

    #[test]
    fn test_placement_wraps_rows_and_pages() {
        let mut grid = ResultsGrid::new(2, 3);
        grid.add_plots(&[100.0], &segments(4));
        grid.add_plots(&[100.0], &segments(4));
        assert_eq!(grid.placement(0), Placement { page: 0, row: 0, col: 0 });
        assert_eq!(grid.placement(4), Placement { page: 0, row: 1, col: 1 });
        assert_eq!(grid.placement(5), Placement { page: 0, row: 1, col: 2 });
        assert_eq!(grid.placement(6), Placement { page: 1, row: 0, col: 0 });
        assert_eq!(grid.page_count(), 2);
        assert_eq!(grid.visible().count(), 6);
        grid.next_page();
        let visible: Vec<usize> = grid.visible().map(|(i, _, _)| i).collect();
        assert_eq!(visible, vec![6, 7]);
    }

    #[test]
    fn test_regrid_keeps_slot_identity() {
        let mut grid = ResultsGrid::new(2, 2);
        let segs = segments(5);
        grid.add_plots(&[100.0], &segs);
        grid.next_page();
        grid.apply_grid(3, 1);
        assert_eq!(grid.current_page(), 0);
        for (i, s) in segs.iter().enumerate() {
            assert_eq!(&grid.slot(i).segment, s);
        }
        assert_eq!(grid.placement(4), Placement { page: 1, row: 1, col: 0 });
    }

    #[test]
    fn test_add_data_shows_slot_page() {
        let mut grid = ResultsGrid::new(1, 2);
        grid.add_plots(&[100.0, 250.5], &segments(5));
        let data = ResponseMatrix::from_rows(vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]);
        grid.add_data(4, data).unwrap();
        assert_eq!(grid.current_page(), 2);

        let plot = grid.slot(4).data.as_ref().unwrap();
        assert_eq!(plot.time, vec![4.0, 4.5, 5.0]);
        assert_eq!(plot.traces[1].name, "250.5Hz");
        assert_eq!(plot.traces[1].values, vec![4.0, 5.0, 6.0]);
        assert_eq!(plot.traces[1].color, PLOT_PALETTE[1]);
        assert!(grid.slot(3).data.is_none());
    }

    #[test]
    fn test_add_data_rejects_bad_input() {
        let mut grid = ResultsGrid::default();
        grid.add_plots(&[100.0], &segments(1));
        assert!(grid.add_data(1, ResponseMatrix::zeros(1, 4)).is_err());
        assert!(grid.add_data(0, ResponseMatrix::zeros(2, 4)).is_err());
    }

    #[test]
    fn test_legend_built_once_and_highlight_exclusive() {
        let mut grid = ResultsGrid::default();
        grid.add_plots(&[110.0, 220.0, 440.0], &segments(1));
        grid.add_plots(&[55.0], &segments(1));
        let labels: Vec<&str> = grid.legend().entries().iter().map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["110Hz", "220Hz", "440Hz"]);

        let legend = grid.legend_mut();
        legend.highlight(Some(0));
        legend.highlight(Some(2));
        assert_eq!(legend.highlighted(), Some(2));
        assert_eq!(legend.entries().iter().filter(|e| e.highlighted).count(), 1);
        legend.highlight(None);
        assert_eq!(legend.highlighted(), None);
    }

    #[test]
    fn test_significant_digit_formatting() {
        assert_eq!(trim_float(12345.6, 4), "1.235e+04");
        assert_eq!(trim_float(9999.6, 4), "1e+04");
        assert_eq!(trim_float(1234.0, 4), "1234");
        assert_eq!(trim_float(0.00012346, 4), "0.0001235");
        assert_eq!(trim_float(0.000012346, 4), "1.235e-05");
        assert_eq!(trim_float(-2.5, 4), "-2.5");
        assert_eq!(trim_float(4186.009, 6), "4186.01");
    }

    #[test]
    fn test_plot_title() {
        let s = Segment::new(0.5, 1.23456, Some(48000), SEGMENT_PALETTE[0]);
        assert_eq!(plot_title(&s), "0.5-1.235 seconds");
        let s = Segment::new(0.0, 2.0, None, SEGMENT_PALETTE[0]);
        assert_eq!(plot_title(&s), "0-2");
    }
}
