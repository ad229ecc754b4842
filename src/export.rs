use anyhow::{Context, Result};
use log::info;
use std::fs::File;
use std::io::Cursor;
use std::path::Path;

use crate::analysis::ResponseMatrix;
use crate::params::DetectorChar;

/// Name of the shared detector table written alongside segment results.
pub const DETECTOR_CHARS_FILE: &str = "detector_characteristics.csv";

/// `"<n0>-<n1>_samples.csv"`
pub fn segment_file_name(n0: usize, n1: usize) -> String {
    format!("{}-{}_samples.csv", n0, n1)
}

/// Write one `frequency,bandwidth` row per detector.
pub fn write_detector_chars<P: AsRef<Path>>(path: P, det_chars: &[DetectorChar]) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| format!("Failed to create CSV file: {:?}", path))?;
    let mut writer = csv::Writer::from_writer(file);

    writer
        .write_record(["frequency_hz", "bandwidth_hz"])
        .context("Failed to write CSV header")?;
    for c in det_chars {
        writer
            .write_record(&[c.freq.to_string(), c.bandwidth.to_string()])
            .context("Failed to write CSV record")?;
    }
    writer.flush().context("Failed to flush CSV writer")?;

    info!("Wrote {} detector(s) to {:?}", det_chars.len(), path);
    Ok(())
}

pub fn read_detector_chars<P: AsRef<Path>>(path: P) -> Result<Vec<DetectorChar>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path).with_context(|| format!("Failed to open CSV file: {:?}", path))?;
    reader
        .records()
        .map(|record| {
            let record = record.context("Failed to read CSV record")?;
            let field = |i: usize| -> Result<f64> {
                let text = record.get(i).context("Missing CSV field")?;
                text.trim().parse().with_context(|| format!("Invalid number '{}'", text))
            };
            Ok(DetectorChar::new(field(0)?, field(1)?))
        })
        .collect()
}

/// Write a response matrix, one row per channel, no header.
pub fn write_matrix<P: AsRef<Path>>(path: P, matrix: &ResponseMatrix) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| format!("Failed to create CSV file: {:?}", path))?;
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);

    for row in matrix.rows() {
        writer
            .write_record(row.iter().map(|v| v.to_string()))
            .context("Failed to write CSV record")?;
    }
    writer.flush().context("Failed to flush CSV writer")?;

    let (channels, columns) = matrix.shape();
    info!("Wrote {}x{} response to {:?}", channels, columns, path);
    Ok(())
}

pub fn read_matrix<P: AsRef<Path>>(path: P) -> Result<ResponseMatrix> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("Failed to open CSV file: {:?}", path))?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.context("Failed to read CSV record")?;
        let row = record
            .iter()
            .map(|v| v.trim().parse::<f64>().with_context(|| format!("Invalid number '{}'", v)))
            .collect::<Result<Vec<f64>>>()?;
        rows.push(row);
    }
    anyhow::ensure!(
        rows.windows(2).all(|w| w[0].len() == w[1].len()),
        "ragged response matrix in {:?}",
        path
    );
    Ok(ResponseMatrix::from_rows(rows))
}

fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };

    let mut buffer = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut buffer, spec)?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(buffer.into_inner())
}

/// Save samples `n0..n1` of `audio` as a mono float WAV. The range is clamped.
pub fn export_segment_wav<P: AsRef<Path>>(
    output_path: P,
    audio: &[f32],
    sample_rate: u32,
    (n0, n1): (usize, usize),
) -> Result<()> {
    let n1 = n1.min(audio.len());
    let n0 = n0.min(n1);
    let wav = encode_wav(&audio[n0..n1], sample_rate)?;
    std::fs::write(output_path.as_ref(), wav)
        .with_context(|| format!("Failed to write {:?}", output_path.as_ref()))?;
    info!("Exported samples {}-{} to {:?}", n0, n1, output_path.as_ref());
    Ok(())
}
