//! Helpers for building detector frequency tables.

use anyhow::{bail, Result};

pub const A4: f64 = 440.0;

/// Frequency of the note `n` semitones from A4.
pub fn semitone_freq(n: i32) -> f64 {
    A4 * 2f64.powf(n as f64 / 12.0)
}

/// Equal-tempered frequencies for semitone offsets `lo..hi` from A4.
pub fn semitones(lo: i32, hi: i32) -> Vec<f64> {
    (lo..hi).map(semitone_freq).collect()
}

/// `ref_freq * 2^(n/edo)` for every step `n` between `n0` and `n1`, inclusive,
/// in either order.
pub fn equation(ref_freq: f64, edo: u32, n0: i32, n1: i32) -> Result<Vec<f64>> {
    if edo == 0 {
        bail!("EDO must be at least 1");
    }
    if !ref_freq.is_finite() || ref_freq <= 0.0 {
        bail!("invalid reference frequency {}", ref_freq);
    }
    let (lo, hi) = if n0 <= n1 { (n0, n1) } else { (n1, n0) };
    Ok((lo..=hi)
        .map(|n| ref_freq * 2f64.powf(n as f64 / edo as f64))
        .collect())
}

/// Parse a note name such as `A4`, `C#3` or `Bb0` into its offset from A4.
pub fn parse_note(name: &str) -> Result<i32> {
    let mut chars = name.trim().chars().peekable();
    let base = match chars.next().map(|c| c.to_ascii_lowercase()) {
        Some('a') => 0,
        Some('b') => 2,
        Some('c') => -9,
        Some('d') => -7,
        Some('e') => -5,
        Some('f') => -4,
        Some('g') => -2,
        _ => bail!("invalid note '{}'", name),
    };
    let alter = match chars.peek() {
        Some('#') => {
            chars.next();
            1
        }
        Some('b') => {
            chars.next();
            -1
        }
        _ => 0,
    };
    let octave: String = chars.collect();
    let octave: i32 = match octave.parse() {
        Ok(o) if (0..=9).contains(&o) => o,
        _ => bail!("invalid octave in note '{}'", name),
    };
    Ok(base + alter + (octave - 4) * 12)
}

/// All semitone frequencies between two notes, inclusive, in either order.
pub fn note_range(start: &str, end: &str) -> Result<Vec<f64>> {
    let a = parse_note(start)?;
    let b = parse_note(end)?;
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    Ok(semitones(lo, hi + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_note() {
        assert_eq!(parse_note("A4").unwrap(), 0);
        assert_eq!(parse_note("a5").unwrap(), 12);
        assert_eq!(parse_note("C4").unwrap(), -9);
        assert_eq!(parse_note("C#4").unwrap(), -8);
        assert_eq!(parse_note("Bb3").unwrap(), -11);
        assert_eq!(parse_note("A0").unwrap(), -48);
        assert_eq!(parse_note("C8").unwrap(), 39);
        assert!(parse_note("H2").is_err());
        assert!(parse_note("A").is_err());
        assert!(parse_note("A12").is_err());
    }

    #[test]
    fn test_note_range_is_order_insensitive() {
        let up = note_range("A3", "A4").unwrap();
        let down = note_range("A4", "A3").unwrap();
        assert_eq!(up, down);
        assert_eq!(up.len(), 13);
        assert!((up[0] - 220.0).abs() < 1e-9);
        assert!((up[12] - 440.0).abs() < 1e-9);
    }

    #[test]
    fn test_equation_steps() {
        let octave = equation(440.0, 12, -12, 12).unwrap();
        assert_eq!(octave.len(), 25);
        assert!((octave[0] - 220.0).abs() < 1e-9);
        assert!((octave[12] - 440.0).abs() < 1e-9);
        assert!((octave[24] - 880.0).abs() < 1e-9);
        assert_eq!(octave, semitones(-12, 13));

        let quarter = equation(100.0, 24, 2, 0).unwrap();
        assert_eq!(quarter.len(), 3);
        assert!((quarter[2] - 100.0 * 2f64.powf(2.0 / 24.0)).abs() < 1e-9);

        assert_eq!(equation(440.0, 12, 3, 3).unwrap(), vec![440.0 * 2f64.powf(0.25)]);
        assert!(equation(440.0, 0, 0, 12).is_err());
        assert!(equation(-1.0, 12, 0, 12).is_err());
    }

    #[test]
    fn test_piano_range_matches_default_table() {
        let piano = note_range("A0", "C8").unwrap();
        assert_eq!(piano, semitones(-48, 40));
    }
}
