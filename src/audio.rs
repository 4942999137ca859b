//! WAV file ingestion for demos and tests.
//!
//! The acoustic pipeline itself consumes raw bytes or float samples; this
//! module only exists so harness code can feed it from canonical WAV files
//! (16 kHz, 16-bit, mono PCM).

use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum AudioError {
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
    #[error("unsupported WAV layout: {0}")]
    UnsupportedLayout(String),
}

/// Read a 16 kHz / 16-bit / mono PCM WAV file as normalized float samples.
pub fn read_wav_samples(path: &Path) -> Result<Vec<f32>, AudioError> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();

    validate_spec(&spec)?;

    let samples: Result<Vec<i16>, _> = reader.samples::<i16>().collect();
    Ok(samples?
        .into_iter()
        .map(|s| s as f32 / 32768.0)
        .collect())
}

/// Read the raw little-endian PCM16 payload of a WAV file, for feeding a
/// backend as audio chunks.
pub fn read_wav_pcm16(path: &Path) -> Result<Vec<u8>, AudioError> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();

    validate_spec(&spec)?;

    let samples: Result<Vec<i16>, _> = reader.samples::<i16>().collect();
    Ok(samples?
        .into_iter()
        .flat_map(|s| s.to_le_bytes())
        .collect())
}

fn validate_spec(spec: &hound::WavSpec) -> Result<(), AudioError> {
    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(AudioError::UnsupportedLayout(format!(
            "expected 16-bit integer PCM, got {}-bit {:?}",
            spec.bits_per_sample, spec.sample_format
        )));
    }
    if spec.channels != 1 {
        return Err(AudioError::UnsupportedLayout(format!(
            "expected mono, got {} channels",
            spec.channels
        )));
    }
    if spec.sample_rate != 16000 {
        return Err(AudioError::UnsupportedLayout(format!(
            "expected 16000 Hz, got {}",
            spec.sample_rate
        )));
    }
    Ok(())
}
