//! Interface to the detector engine, plus a reference implementation.
//!
//! The analyser only sees the three traits below: an engine builds a detector
//! over a slice of audio, the detector turns into a block cache, and the cache
//! is read one `(channel, sample)` at a time.

use std::collections::VecDeque;
use std::f64::consts::PI;
use std::ops::Range;
use std::sync::Arc;

use anyhow::{bail, ensure, Result};
use log::debug;
use num_complex::Complex64;

use crate::params::{AmpNorm, DetectorParams, FreqNorm, NumericalMethod};

pub trait DetectorEngine: Send + Sync {
    fn build_detector(
        &self,
        sample_rate: u32,
        audio: Arc<[f32]>,
        range: Range<usize>,
        params: &DetectorParams,
    ) -> Result<Box<dyn Detector>>;
}

pub trait Detector: Send {
    fn channel_count(&self) -> usize;

    /// Wrap the detector in a cache holding at most `block_count` blocks of
    /// `block_size` samples.
    fn into_cache(self: Box<Self>, block_count: usize, block_size: usize) -> Result<Box<dyn ResponseCache>>;
}

pub trait ResponseCache: Send {
    /// Exclusive upper bound of readable sample indices.
    fn end(&self) -> usize;

    fn get(&mut self, channel: usize, n: usize) -> Result<f64>;
}

/// Bank of damped complex resonators, one per detector:
/// `z' = (iω - d) z + x`, output `gain * |z|`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResonatorBank;

impl DetectorEngine for ResonatorBank {
    fn build_detector(
        &self,
        sample_rate: u32,
        audio: Arc<[f32]>,
        range: Range<usize>,
        params: &DetectorParams,
    ) -> Result<Box<dyn Detector>> {
        ensure!(sample_rate > 0, "sample rate must be positive");
        ensure!(range.start <= range.end && range.end <= audio.len(), "audio range {:?} out of bounds", range);
        ensure!(!params.det_chars.is_empty(), "no detectors given");
        params.validate()?;

        let sr = sample_rate as f64;
        let h = 1.0 / sr;
        let channels = params
            .det_chars
            .iter()
            .map(|c| {
                let mut omega = 2.0 * PI * c.freq;
                if params.features.freq_norm == FreqNorm::SearchNormalized
                    && params.features.method == NumericalMethod::CentralDifference
                {
                    // leapfrog advances phase by asin(ω'h); pick ω' so that equals ωh
                    omega = (omega * h).min(PI / 2.0).sin() / h;
                }
                let damping = if c.bandwidth > 0.0 { PI * c.bandwidth } else { params.damping };
                let scale = match params.features.amp_norm {
                    AmpNorm::Unnormalized => 1.0,
                    AmpNorm::Normalized => 2.0 * damping,
                };
                Resonator { omega, damping, scale, z: Complex64::new(0.0, 0.0), z_prev: None }
            })
            .collect();

        let threads = if params.num_threads == 0 {
            crate::params::default_threads()
        } else {
            params.num_threads
        };

        Ok(Box::new(Resonators {
            audio,
            range,
            h,
            gain: params.gain,
            method: params.features.method,
            threads,
            channels,
        }))
    }
}

#[derive(Clone, Debug)]
struct Resonator {
    omega: f64,
    damping: f64,
    scale: f64,
    z: Complex64,
    // previous state, for central difference
    z_prev: Option<Complex64>,
}

impl Resonator {
    fn deriv(&self, z: Complex64, x: f64) -> Complex64 {
        Complex64::new(-self.damping, self.omega) * z + x
    }

    fn step(&mut self, method: NumericalMethod, h: f64, x0: f64, x1: f64) {
        match method {
            NumericalMethod::RungeKutta => {
                let xm = 0.5 * (x0 + x1);
                let z = self.z;
                let k1 = self.deriv(z, x0);
                let k2 = self.deriv(z + k1 * (h / 2.0), xm);
                let k3 = self.deriv(z + k2 * (h / 2.0), xm);
                let k4 = self.deriv(z + k3 * h, x1);
                self.z = z + (k1 + k2 * 2.0 + k3 * 2.0 + k4) * (h / 6.0);
            }
            NumericalMethod::CentralDifference => {
                let z = self.z;
                let next = match self.z_prev {
                    Some(prev) => prev + self.deriv(z, x0) * (2.0 * h),
                    // first step is forward Euler
                    None => z + self.deriv(z, x0) * h,
                };
                self.z_prev = Some(z);
                self.z = next;
            }
        }
    }

    fn process(&mut self, method: NumericalMethod, h: f64, gain: f64, input: &[f32], next: f32, out: &mut Vec<f64>) {
        for (i, &x) in input.iter().enumerate() {
            let x1 = input.get(i + 1).copied().unwrap_or(next);
            self.step(method, h, x as f64, x1 as f64);
            out.push(gain * self.scale * self.z.norm());
        }
    }
}

struct Resonators {
    audio: Arc<[f32]>,
    range: Range<usize>,
    h: f64,
    gain: f64,
    method: NumericalMethod,
    threads: usize,
    channels: Vec<Resonator>,
}

impl Resonators {
    /// Advance all channels over `pos..pos+len` (relative to the slice start).
    /// Returns one row per channel.
    fn compute(&mut self, pos: usize, len: usize) -> Vec<Vec<f64>> {
        let start = self.range.start + pos;
        let stop = (start + len).min(self.range.end);
        let input = &self.audio[start..stop];
        let next = if stop < self.range.end { self.audio[stop] } else { 0.0 };
        let (method, h, gain) = (self.method, self.h, self.gain);

        let mut rows: Vec<Vec<f64>> = (0..self.channels.len())
            .map(|_| Vec::with_capacity(input.len()))
            .collect();
        let per_thread = self.channels.len().div_ceil(self.threads.max(1)).max(1);

        if self.threads <= 1 || self.channels.len() <= 1 {
            for (res, row) in self.channels.iter_mut().zip(rows.iter_mut()) {
                res.process(method, h, gain, input, next, row);
            }
        } else {
            std::thread::scope(|s| {
                for (res_chunk, row_chunk) in self
                    .channels
                    .chunks_mut(per_thread)
                    .zip(rows.chunks_mut(per_thread))
                {
                    s.spawn(move || {
                        for (res, row) in res_chunk.iter_mut().zip(row_chunk.iter_mut()) {
                            res.process(method, h, gain, input, next, row);
                        }
                    });
                }
            });
        }
        rows
    }
}

impl Detector for Resonators {
    fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn into_cache(self: Box<Self>, block_count: usize, block_size: usize) -> Result<Box<dyn ResponseCache>> {
        ensure!(block_count > 0 && block_size > 0, "cache needs at least one non-empty block");
        Ok(Box::new(BlockCache {
            end: self.range.len(),
            detector: *self,
            blocks: VecDeque::with_capacity(block_count),
            block_count,
            block_size,
            computed: 0,
        }))
    }
}

/// Sliding window of computed blocks. Blocks are produced in order on demand
/// and the oldest is dropped once `block_count` are held.
struct BlockCache {
    detector: Resonators,
    blocks: VecDeque<(usize, Vec<Vec<f64>>)>,
    block_count: usize,
    block_size: usize,
    computed: usize,
    end: usize,
}

impl ResponseCache for BlockCache {
    fn end(&self) -> usize {
        self.end
    }

    fn get(&mut self, channel: usize, n: usize) -> Result<f64> {
        if n >= self.end {
            bail!("sample {} beyond cache end {}", n, self.end);
        }
        if channel >= self.detector.channels.len() {
            bail!("channel {} out of range", channel);
        }
        while n >= self.computed {
            debug!("computing block at sample {}", self.computed);
            let block = self.detector.compute(self.computed, self.block_size);
            self.blocks.push_back((self.computed, block));
            self.computed = (self.computed + self.block_size).min(self.end);
            if self.blocks.len() > self.block_count {
                self.blocks.pop_front();
            }
        }
        let Some(&(first, _)) = self.blocks.front() else {
            bail!("cache is empty");
        };
        if n < first {
            bail!("sample {} already evicted (oldest cached is {})", n, first);
        }
        let idx = (n - first) / self.block_size;
        let (start, rows) = &self.blocks[idx];
        Ok(rows[channel][n - start])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{DetectorChar, Features};

    fn sine(freq: f64, sr: u32, seconds: f64) -> Arc<[f32]> {
        let n = (sr as f64 * seconds) as usize;
        (0..n)
            .map(|i| (2.0 * PI * freq * i as f64 / sr as f64).sin() as f32)
            .collect::<Vec<f32>>()
            .into()
    }

    fn params(freqs: &[f64], threads: usize) -> DetectorParams {
        DetectorParams {
            sample_rate: 8000.0,
            num_threads: threads,
            det_chars: freqs.iter().map(|&f| DetectorChar::new(f, 0.0)).collect(),
            damping: 0.0001,
            gain: 1.0,
            features: Features::default(),
        }
    }

    fn last_values(cache: &mut dyn ResponseCache, channels: usize) -> Vec<f64> {
        let mut last = vec![0.0; channels];
        for n in 0..cache.end() {
            for (k, v) in last.iter_mut().enumerate() {
                *v = cache.get(k, n).unwrap();
            }
        }
        last
    }

    #[test]
    fn test_resonant_channel_dominates() {
        let audio = sine(440.0, 8000, 1.0);
        let len = audio.len();
        let det = ResonatorBank
            .build_detector(8000, audio, 0..len, &params(&[440.0, 880.0], 1))
            .unwrap();
        assert_eq!(det.channel_count(), 2);
        let mut cache = det.into_cache(10, 240).unwrap();
        assert_eq!(cache.end(), 8000);
        let last = last_values(cache.as_mut(), 2);
        assert!(last[0] > 0.3, "resonant response {}", last[0]);
        assert!(last[0] > 100.0 * last[1]);
    }

    #[test]
    fn test_threaded_matches_single_thread() {
        let audio = sine(330.0, 8000, 0.25);
        let len = audio.len();
        let freqs = [220.0, 330.0, 440.0, 550.0, 660.0];
        let mut a = ResonatorBank
            .build_detector(8000, audio.clone(), 0..len, &params(&freqs, 1))
            .unwrap()
            .into_cache(4, 100)
            .unwrap();
        let mut b = ResonatorBank
            .build_detector(8000, audio, 0..len, &params(&freqs, 3))
            .unwrap()
            .into_cache(4, 100)
            .unwrap();
        assert_eq!(last_values(a.as_mut(), 5), last_values(b.as_mut(), 5));
    }

    #[test]
    fn test_cache_evicts_old_blocks() {
        let audio = sine(440.0, 8000, 0.1);
        let det = ResonatorBank
            .build_detector(8000, audio, 100..700, &params(&[440.0], 1))
            .unwrap();
        let mut cache = det.into_cache(2, 100).unwrap();
        assert_eq!(cache.end(), 600);
        assert!(cache.get(0, 450).is_ok());
        assert!(cache.get(0, 50).is_err());
        assert!(cache.get(0, 350).is_ok());
        assert!(cache.get(0, 600).is_err());
        assert!(cache.get(1, 400).is_err());
    }

    #[test]
    fn test_amplitude_normalization_scales_by_damping() {
        let audio = sine(440.0, 8000, 0.2);
        let len = audio.len();
        let mut p = params(&[440.0], 1);
        let mut raw = ResonatorBank.build_detector(8000, audio.clone(), 0..len, &p).unwrap().into_cache(10, 80).unwrap();
        p.features.amp_norm = AmpNorm::Normalized;
        let mut norm = ResonatorBank.build_detector(8000, audio, 0..len, &p).unwrap().into_cache(10, 80).unwrap();
        let r = last_values(raw.as_mut(), 1)[0];
        let n = last_values(norm.as_mut(), 1)[0];
        assert!((n - r * 2.0 * 0.0001).abs() < 1e-12);
    }

    #[test]
    fn test_central_difference_rejects_bandwidth() {
        let audio = sine(440.0, 8000, 0.1);
        let mut p = params(&[440.0], 1);
        p.features.method = NumericalMethod::CentralDifference;
        p.det_chars[0].bandwidth = 3.0;
        assert!(ResonatorBank.build_detector(8000, audio, 0..800, &p).is_err());
    }

    #[test]
    fn test_central_difference_runs() {
        let audio = sine(440.0, 8000, 0.5);
        let len = audio.len();
        let mut p = params(&[440.0, 1000.0], 2);
        p.features.method = NumericalMethod::CentralDifference;
        p.features.freq_norm = FreqNorm::SearchNormalized;
        let mut cache = ResonatorBank.build_detector(8000, audio, 0..len, &p).unwrap().into_cache(10, 240).unwrap();
        let last = last_values(cache.as_mut(), 2);
        assert!(last[0].is_finite() && last[0] > last[1]);
    }
}
