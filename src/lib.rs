pub mod audio;
pub mod segment;
pub mod registry;
pub mod params;
pub mod freqs;
pub mod engine;
pub mod analysis;
pub mod results;
pub mod export;
pub mod profile;
pub mod settings;
pub mod player;
pub mod error;
pub mod gui;

pub use analysis::{AnalysisEvent, AnalysisTask, Analyser, ResponseMatrix};
pub use error::SetupError;
pub use params::DetectorParams;
pub use registry::SegmentRegistry;
pub use results::ResultsGrid;
pub use segment::Segment;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub const fn from_hex(hex: u32, a: u8) -> Self {
        Self {
            r: (hex >> 16) as u8,
            g: (hex >> 8) as u8,
            b: hex as u8,
            a,
        }
    }

    /// `#rrggbb`, alpha dropped.
    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }

    pub fn opaque(self) -> Self {
        Self { a: 0xff, ..self }
    }
}

// Segment regions are drawn translucent over the waveform
const SEGMENT_ALPHA: u8 = 0x32;

pub const SEGMENT_PALETTE: [Color; 8] = [
    Color::from_hex(0x0000ff, SEGMENT_ALPHA),
    Color::from_hex(0xff0000, SEGMENT_ALPHA),
    Color::from_hex(0x00ff00, SEGMENT_ALPHA),
    Color::from_hex(0xffe523, SEGMENT_ALPHA),
    Color::from_hex(0xed21ff, SEGMENT_ALPHA),
    Color::from_hex(0xff672b, SEGMENT_ALPHA),
    Color::from_hex(0x9718ff, SEGMENT_ALPHA),
    Color::from_hex(0x00ffaa, SEGMENT_ALPHA),
];

// yellow, red, firebrick, darkorange, deeppink, darkmagenta, mediumvioletred,
// green, lime, darkslategrey, lightslategrey, skyblue, blue
pub const PLOT_PALETTE: [Color; 13] = [
    Color::from_hex(0xFFFF00, 0xff),
    Color::from_hex(0xFF0000, 0xff),
    Color::from_hex(0xB22222, 0xff),
    Color::from_hex(0xFF8C00, 0xff),
    Color::from_hex(0xFF1493, 0xff),
    Color::from_hex(0x8B008B, 0xff),
    Color::from_hex(0xC71585, 0xff),
    Color::from_hex(0x008000, 0xff),
    Color::from_hex(0x00FF00, 0xff),
    Color::from_hex(0x2F4F4F, 0xff),
    Color::from_hex(0x778899, 0xff),
    Color::from_hex(0x87CEEB, 0xff),
    Color::from_hex(0x0000FF, 0xff),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_hex() {
        let c = Color::from_hex(0xff672b, SEGMENT_ALPHA);
        assert_eq!((c.r, c.g, c.b, c.a), (0xff, 0x67, 0x2b, 0x32));
        assert_eq!(c.to_hex(), "#ff672b");
        assert_eq!(c.opaque().a, 0xff);
    }
}
