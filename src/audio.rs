use anyhow::{bail, Context, Result};
use log::{info, warn};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::{MetadataOptions, StandardTagKey};
use symphonia::core::probe::Hint;

use std::fs::File;
use std::path::Path;

/// Decoded audio, mixed down to one channel.
#[derive(Clone, Debug)]
pub struct AudioData {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Channel count of the source before mixing
    pub channels: u16,
    pub title: Option<String>,
}

impl AudioData {
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            0.0
        } else {
            self.samples.len() as f64 / self.sample_rate as f64
        }
    }
}

pub fn load_audio_from_source(source: Box<dyn MediaSource>, hint: &Hint) -> Result<AudioData> {
    let mss = MediaSourceStream::new(source, Default::default());

    let meta_opts: MetadataOptions = Default::default();
    let fmt_opts: FormatOptions = Default::default();

    let mut probed = symphonia::default::get_probe()
        .format(hint, mss, &fmt_opts, &meta_opts)
        .context("unsupported format")?;

    let mut title = None;
    if let Some(metadata) = probed.format.metadata().current() {
        title = metadata
            .tags()
            .iter()
            .find(|tag| tag.std_key == Some(StandardTagKey::TrackTitle))
            .map(|tag| tag.value.to_string());
    }

    let mut format = probed.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .context("no supported audio track")?;

    let dec_opts: DecoderOptions = Default::default();
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &dec_opts)
        .context("unsupported codec")?;

    let track_id = track.id;
    let mut samples: Vec<f32> = Vec::new();
    let mut sample_rate = 0;
    let mut channels = 0;
    let mut buffer: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(Error::IoError(_)) => break,
            Err(e) => {
                warn!("stopped reading packets: {}", e);
                break;
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                if sample_rate == 0 {
                    sample_rate = spec.rate;
                    channels = spec.channels.count() as u16;
                }
                let needed = decoded.capacity() * spec.channels.count();
                if buffer.as_ref().map_or(true, |b| b.capacity() < needed) {
                    buffer = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
                }
                if let Some(buf) = buffer.as_mut() {
                    buf.copy_interleaved_ref(decoded);
                    mix_to_mono(buf.samples(), spec.channels.count(), &mut samples);
                }
            }
            Err(Error::DecodeError(e)) => warn!("skipping undecodable packet: {}", e),
            Err(e) => return Err(e).context("decoder failed"),
        }
    }

    if sample_rate == 0 {
        bail!("no audio frames decoded");
    }

    Ok(AudioData {
        samples,
        sample_rate,
        channels,
        title,
    })
}

/// Average interleaved frames into `out`.
fn mix_to_mono(interleaved: &[f32], channels: usize, out: &mut Vec<f32>) {
    if channels <= 1 {
        out.extend_from_slice(interleaved);
        return;
    }
    out.extend(
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32),
    );
}

pub fn load_audio_file<P: AsRef<Path>>(path: P) -> Result<AudioData> {
    let path = path.as_ref();
    let src = File::open(path).with_context(|| format!("failed to open audio file {:?}", path))?;

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let data = load_audio_from_source(Box::new(src), &hint)
        .with_context(|| format!("failed to decode {:?}", path))?;
    info!(
        "Opened {:?}: {} Hz, {} channel(s), {:.2} s",
        path,
        data.sample_rate,
        data.channels,
        data.duration()
    );
    Ok(data)
}

/// Mono samples in `[-1, 1]` and the sample rate of the file at `path`.
pub fn read_audio<P: AsRef<Path>>(path: P) -> Result<(Vec<f32>, u32)> {
    let data = load_audio_file(path)?;
    Ok((data.samples, data.sample_rate))
}
