//! Log-mel filterbank feature extraction.
//!
//! Produces the 80-bin log-mel features the FastConformer acoustic model was
//! trained on. The configuration is locked to the training pipeline: periodic
//! Hann window, power spectrum, O'Shaughnessy mel scale, natural log with a
//! 1e-10 floor. Small deviations in any of these produce features that look
//! plausible but collapse the CTC output to silence, so the defaults here
//! should not be changed for the canonical model.

use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::f32::consts::PI;
use std::fs;
use std::path::Path;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum FeatureError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid CMVN stats: {0}")]
    BadCmvnFile(String),
}

/// Filterbank extraction parameters.
///
/// Defaults match the NeMo FastConformer preprocessor (16 kHz, 25 ms frames,
/// 10 ms shift, 80 mel bins over 0-8000 Hz).
#[derive(Debug, Clone)]
pub struct FbankConfig {
    pub sample_rate: u32,
    pub num_mel_bins: usize,
    pub frame_length_ms: f32,
    pub frame_shift_ms: f32,
    pub n_fft: usize,
    pub low_freq: f32,
    pub high_freq: f32,
    /// Std-dev of additive Gaussian dither applied before framing. 0 disables.
    pub dither: f32,
    pub remove_dc_offset: bool,
    pub preemphasis_coeff: f32,
    /// When true, only frames fully inside the signal are emitted. When false
    /// (the model default), frames are centered half a shift past the origin
    /// and edges are reflected.
    pub snip_edges: bool,
    pub log_floor: f32,
}

impl Default for FbankConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            num_mel_bins: 80,
            frame_length_ms: 25.0,
            frame_shift_ms: 10.0,
            n_fft: 512,
            low_freq: 0.0,
            high_freq: 8000.0,
            dither: 1e-5,
            remove_dc_offset: true,
            preemphasis_coeff: 0.0,
            snip_edges: false,
            log_floor: 1e-10,
        }
    }
}

impl FbankConfig {
    pub fn frame_length(&self) -> usize {
        (self.frame_length_ms / 1000.0 * self.sample_rate as f32) as usize
    }

    pub fn frame_shift(&self) -> usize {
        (self.frame_shift_ms / 1000.0 * self.sample_rate as f32) as usize
    }
}

/// Per-feature mean/variance normalization stats.
///
/// Loaded from a `global_cmvn.stats` file: one line of means, one line of
/// variances (both `num_mel_bins` floats), optionally followed by a frame
/// count. Lines starting with `#` are comments.
#[derive(Debug, Clone)]
pub struct CmvnStats {
    mean: Array1<f32>,
    inv_std: Array1<f32>,
}

impl CmvnStats {
    pub fn load(path: &Path, num_bins: usize) -> Result<Self, FeatureError> {
        let contents = fs::read_to_string(path)?;
        let rows: Vec<Vec<f32>> = contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(|l| {
                l.split_whitespace()
                    .map(|tok| {
                        tok.parse::<f32>().map_err(|e| {
                            FeatureError::BadCmvnFile(format!("bad value '{}': {}", tok, e))
                        })
                    })
                    .collect()
            })
            .collect::<Result<_, _>>()?;

        if rows.len() < 2 {
            return Err(FeatureError::BadCmvnFile(format!(
                "expected mean and variance rows, found {} rows",
                rows.len()
            )));
        }

        let stats = Self::from_mean_var(rows[0].clone(), rows[1].clone())?;
        if stats.mean.len() != num_bins {
            return Err(FeatureError::BadCmvnFile(format!(
                "stats have {} bins, extractor uses {}",
                stats.mean.len(),
                num_bins
            )));
        }

        log::info!("Loaded CMVN stats ({} bins) from {:?}", num_bins, path);
        Ok(stats)
    }

    pub fn from_mean_var(mean: Vec<f32>, var: Vec<f32>) -> Result<Self, FeatureError> {
        if mean.len() != var.len() {
            return Err(FeatureError::BadCmvnFile(format!(
                "mean has {} values, variance has {}",
                mean.len(),
                var.len()
            )));
        }

        // Zero or negative variance maps to unit scale
        let inv_std: Vec<f32> = var
            .iter()
            .map(|&v| if v > 0.0 { 1.0 / v.sqrt() } else { 1.0 })
            .collect();

        Ok(Self {
            mean: Array1::from_vec(mean),
            inv_std: Array1::from_vec(inv_std),
        })
    }

    fn apply(&self, features: &mut Array2<f32>) {
        for mut row in features.rows_mut() {
            for (j, v) in row.iter_mut().enumerate() {
                *v = (*v - self.mean[j]) * self.inv_std[j];
            }
        }
    }
}

/// Log-mel feature extractor with precomputed DSP state.
pub struct FbankComputer {
    config: FbankConfig,
    window: Vec<f32>,
    filterbank: Array2<f32>,
    fft: Arc<dyn Fft<f32>>,
    cmvn: Option<CmvnStats>,
    dither_rng: StdRng,
    dither_seed: u64,
}

impl FbankComputer {
    pub fn new(config: FbankConfig) -> Self {
        let frame_length = config.frame_length();

        // Periodic Hann: 0.5 - 0.5*cos(2*pi*i/L)
        let window: Vec<f32> = (0..frame_length)
            .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / frame_length as f32).cos())
            .collect();

        let filterbank = compute_mel_filterbank(
            config.num_mel_bins,
            config.n_fft,
            config.sample_rate,
            config.low_freq,
            config.high_freq,
        );

        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(config.n_fft);

        let dither_seed = 0x5eed;

        Self {
            config,
            window,
            filterbank,
            fft,
            cmvn: None,
            dither_rng: StdRng::seed_from_u64(dither_seed),
            dither_seed,
        }
    }

    pub fn config(&self) -> &FbankConfig {
        &self.config
    }

    /// Install normalization stats. `None` clears them (identity).
    pub fn set_cmvn(&mut self, stats: Option<CmvnStats>) {
        self.cmvn = stats;
    }

    /// Reseed the dither source so an identical sample sequence reproduces
    /// identical features.
    pub fn reset(&mut self) {
        self.dither_rng = StdRng::seed_from_u64(self.dither_seed);
    }

    /// Frame count produced for `num_samples` input samples.
    pub fn num_frames(&self, num_samples: usize) -> usize {
        let length = self.config.frame_length();
        let shift = self.config.frame_shift();
        if num_samples < length {
            return 0;
        }
        if self.config.snip_edges {
            1 + (num_samples - length) / shift
        } else {
            (num_samples + shift / 2) / shift
        }
    }

    /// Compute log-mel features, one row of `num_mel_bins` values per frame.
    pub fn compute(&mut self, samples: &[f32]) -> Array2<f32> {
        let num_bins = self.config.num_mel_bins;
        let num_frames = self.num_frames(samples.len());
        if num_frames == 0 {
            return Array2::zeros((0, num_bins));
        }

        let frame_length = self.config.frame_length();
        let n_fft = self.config.n_fft;
        let num_fft_bins = n_fft / 2 + 1;

        let samples = self.dithered(samples);

        let mut features = Array2::zeros((num_frames, num_bins));
        let mut frame = vec![0.0f32; frame_length];
        let mut fft_buf = vec![Complex::new(0.0f32, 0.0f32); n_fft];
        let mut power = vec![0.0f32; num_fft_bins];

        for t in 0..num_frames {
            self.fill_frame(&samples, t, &mut frame);

            if self.config.remove_dc_offset {
                let mean = frame.iter().sum::<f32>() / frame_length as f32;
                for s in frame.iter_mut() {
                    *s -= mean;
                }
            }

            let coeff = self.config.preemphasis_coeff;
            if coeff != 0.0 {
                for j in (1..frame_length).rev() {
                    frame[j] -= coeff * frame[j - 1];
                }
                frame[0] *= 1.0 - coeff;
            }

            for (dst, (&s, &w)) in fft_buf
                .iter_mut()
                .zip(frame.iter().zip(self.window.iter()))
            {
                *dst = Complex::new(s * w, 0.0);
            }
            for dst in fft_buf.iter_mut().skip(frame_length) {
                *dst = Complex::new(0.0, 0.0);
            }

            self.fft.process(&mut fft_buf);

            for (bin, val) in fft_buf.iter().take(num_fft_bins).enumerate() {
                power[bin] = val.norm_sqr();
            }

            for m in 0..num_bins {
                let energy: f32 = self
                    .filterbank
                    .row(m)
                    .iter()
                    .zip(power.iter())
                    .map(|(&w, &p)| w * p)
                    .sum();
                features[[t, m]] = energy.max(self.config.log_floor).ln();
            }
        }

        if let Some(cmvn) = &self.cmvn {
            cmvn.apply(&mut features);
        }

        features
    }

    fn dithered(&mut self, samples: &[f32]) -> Vec<f32> {
        if self.config.dither <= 0.0 {
            return samples.to_vec();
        }
        // Normal::new only fails for non-finite sigma; dither > 0 is checked
        let dist = Normal::new(0.0f32, self.config.dither)
            .unwrap_or_else(|_| Normal::new(0.0, 0.0).unwrap());
        samples
            .iter()
            .map(|&s| s + dist.sample(&mut self.dither_rng))
            .collect()
    }

    /// Copy frame `t` out of the signal, reflecting samples that fall outside
    /// it. With snip-edges disabled the frame is centered at
    /// `t*shift + shift/2`.
    fn fill_frame(&self, samples: &[f32], t: usize, frame: &mut [f32]) {
        let frame_length = self.config.frame_length() as isize;
        let frame_shift = self.config.frame_shift() as isize;
        let n = samples.len() as isize;

        let start = if self.config.snip_edges {
            t as isize * frame_shift
        } else {
            t as isize * frame_shift + frame_shift / 2 - frame_length / 2
        };

        for (j, dst) in frame.iter_mut().enumerate() {
            let mut s = start + j as isize;
            while s < 0 || s >= n {
                if s < 0 {
                    s = -s - 1;
                } else {
                    s = 2 * n - 1 - s;
                }
            }
            *dst = samples[s as usize];
        }
    }
}

/// Mel filterbank matrix [num_mel_bins, n_fft/2+1].
///
/// Mel scale is O'Shaughnessy (`2595*log10(1 + f/700)`); filter edges are
/// mapped to FFT bins with `floor((n_fft+1)*f/sr)`.
fn compute_mel_filterbank(
    num_mel_bins: usize,
    n_fft: usize,
    sample_rate: u32,
    low_freq: f32,
    high_freq: f32,
) -> Array2<f32> {
    let num_fft_bins = n_fft / 2 + 1;

    let hz_to_mel = |f: f32| -> f32 { 2595.0 * (1.0 + f / 700.0).log10() };
    let mel_to_hz = |m: f32| -> f32 { 700.0 * (10.0f32.powf(m / 2595.0) - 1.0) };

    let mel_low = hz_to_mel(low_freq);
    let mel_high = hz_to_mel(high_freq);

    let mel_points: Vec<f32> = (0..num_mel_bins + 2)
        .map(|i| mel_low + (mel_high - mel_low) * i as f32 / (num_mel_bins + 1) as f32)
        .collect();

    let bin_points: Vec<usize> = mel_points
        .iter()
        .map(|&m| ((n_fft + 1) as f32 * mel_to_hz(m) / sample_rate as f32).floor() as usize)
        .collect();

    let mut filterbank = Array2::<f32>::zeros((num_mel_bins, num_fft_bins));
    let mut zero_width = 0usize;

    for m in 0..num_mel_bins {
        let left = bin_points[m];
        let center = bin_points[m + 1];
        let right = bin_points[m + 2];

        if left == center || center == right {
            zero_width += 1;
            continue;
        }

        for bin in left..center.min(num_fft_bins) {
            filterbank[[m, bin]] = (bin - left) as f32 / (center - left) as f32;
        }
        for bin in center..right.min(num_fft_bins) {
            filterbank[[m, bin]] = (right - bin) as f32 / (right - center) as f32;
        }
    }

    if zero_width > 0 {
        log::warn!(
            "mel filterbank has {} zero-width filters ({} bins over {}-{} Hz, fft {})",
            zero_width,
            num_mel_bins,
            low_freq,
            high_freq,
            n_fft
        );
    }

    filterbank
}
