//! Uniform speech-to-text backend interface.
//!
//! Consumers hand a backend audio chunks and receive partial/final
//! transcripts; the acoustic pipeline behind it is opaque. Backends are
//! selected by name through [`create_backend`], a closed mapping used only
//! for config-driven selection.

pub mod fastconformer;

pub use fastconformer::FastConformerBackend;

use std::collections::HashMap;

use crate::features::FeatureError;
use crate::model::ModelError;
use crate::stream::StreamError;
use crate::vocab::VocabError;

#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("missing required config key: {0}")]
    MissingConfig(&'static str),
    #[error("backend already initialized; call reset() to reuse the session")]
    AlreadyInitialized,
    #[error("unknown backend '{0}' (available: {1})")]
    UnknownBackend(String, String),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Vocab(#[from] VocabError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Wire encoding of an audio chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEncoding {
    Pcm16,
    Pcm8,
    Ulaw,
    Alaw,
}

impl AudioEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioEncoding::Pcm16 => "pcm16",
            AudioEncoding::Pcm8 => "pcm8",
            AudioEncoding::Ulaw => "ulaw",
            AudioEncoding::Alaw => "alaw",
        }
    }
}

/// Identity of the channel a chunk was captured from.
#[derive(Debug, Clone)]
pub struct ChannelId {
    /// 0-based channel index; -1 for mono/mixed.
    pub index: i32,
    /// Role label such as "caller" or "agent".
    pub role: String,
}

/// One chunk of raw audio handed to a backend. Borrowed, immutable, and
/// consumed within a single `process_audio` call.
#[derive(Debug, Clone)]
pub struct AudioChunk<'a> {
    pub data: &'a [u8],
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub timestamp_ms: u64,
    pub channel: Option<ChannelId>,
}

impl<'a> AudioChunk<'a> {
    /// Mono 16 kHz PCM16 chunk, the canonical input.
    pub fn pcm16_mono(data: &'a [u8], timestamp_ms: u64) -> Self {
        Self {
            data,
            encoding: AudioEncoding::Pcm16,
            sample_rate: 16000,
            channels: 1,
            bits_per_sample: 16,
            timestamp_ms,
            channel: None,
        }
    }

    /// Byte count must be a whole number of sample frames.
    pub fn is_frame_aligned(&self) -> bool {
        let frame_bytes = (self.bits_per_sample as usize / 8) * self.channels as usize;
        frame_bytes > 0 && self.data.len() % frame_bytes == 0
    }
}

/// Decode a chunk into per-channel float samples at 16 kHz.
///
/// This is the pre-backend splitting step for stereo/telephony capture: each
/// returned channel can then be fed to its own backend session as mono
/// PCM16. Mono chunks come back with only `left` populated. Telephony-rate
/// sources are upsampled; downsampling is rejected by the codec layer.
pub fn split_audio_chunk(
    chunk: &AudioChunk<'_>,
) -> Result<crate::codec::ChannelBuffers, crate::codec::CodecError> {
    use crate::codec::{self, ChannelBuffers, SplitOptions};

    let stereo = chunk.channels >= 2;
    let opts = SplitOptions {
        normalize: true,
        source_rate_hz: chunk.sample_rate,
        target_rate_hz: 16000,
    };

    let buffers = match chunk.encoding {
        AudioEncoding::Pcm16 if stereo => codec::decode_pcm16(chunk.data, &opts)?,
        AudioEncoding::Pcm16 => ChannelBuffers {
            left: codec::pcm16_to_f32(chunk.data)?,
            right: Vec::new(),
        },
        AudioEncoding::Pcm8 if stereo => codec::decode_pcm8(chunk.data, &opts)?,
        AudioEncoding::Pcm8 => ChannelBuffers {
            left: chunk
                .data
                .iter()
                .map(|&b| (b as i16 - 128) as f32 / 128.0)
                .collect(),
            right: Vec::new(),
        },
        AudioEncoding::Ulaw if stereo => codec::decode_g711_ulaw(chunk.data, true)?,
        AudioEncoding::Ulaw => ChannelBuffers {
            left: codec::g711_ulaw_to_f32(chunk.data),
            right: Vec::new(),
        },
        AudioEncoding::Alaw if stereo => codec::decode_g711_alaw(chunk.data, true)?,
        AudioEncoding::Alaw => ChannelBuffers {
            left: codec::g711_alaw_to_f32(chunk.data),
            right: Vec::new(),
        },
    };

    // Stereo PCM paths resample through SplitOptions; mono and G.711 paths
    // resample here
    if chunk.sample_rate != 16000
        && !(stereo && matches!(chunk.encoding, AudioEncoding::Pcm16 | AudioEncoding::Pcm8))
    {
        return Ok(crate::codec::ChannelBuffers {
            left: codec::resample(&buffers.left, chunk.sample_rate, 16000)?,
            right: codec::resample(&buffers.right, chunk.sample_rate, 16000)?,
        });
    }

    Ok(buffers)
}

/// Per-call transcription options. Advisory for the local acoustic pipeline.
#[derive(Debug, Clone)]
pub struct TranscriptionOptions {
    pub language_code: String,
    pub enable_punctuation: bool,
    pub enable_word_timings: bool,
    pub enable_speaker_labels: bool,
    pub max_alternatives: usize,
}

impl Default for TranscriptionOptions {
    fn default() -> Self {
        Self {
            language_code: "en-US".to_string(),
            enable_punctuation: true,
            enable_word_timings: false,
            enable_speaker_labels: false,
            max_alternatives: 1,
        }
    }
}

/// Per-word timing, for backends that produce it.
#[derive(Debug, Clone)]
pub struct WordTiming {
    pub word: String,
    pub start_time_s: f64,
    pub end_time_s: f64,
    pub confidence: f64,
}

/// Speaker attribution, for backends that produce it.
#[derive(Debug, Clone)]
pub struct SpeakerInfo {
    pub speaker_id: i32,
    pub speaker_label: String,
    pub confidence: f64,
}

/// Result of one backend call: either transcript fields or an error pair,
/// never both.
///
/// `word_timings`, `speakers`, and `alternatives` stay empty for backends
/// whose capabilities do not advertise them.
#[derive(Debug, Clone, Default)]
pub struct TranscriptionResult {
    pub text: String,
    pub confidence: f64,
    pub is_final: bool,
    pub start_time_ms: u64,
    pub end_time_ms: u64,
    pub detected_language: String,
    pub word_timings: Vec<WordTiming>,
    pub speakers: Vec<SpeakerInfo>,
    pub alternatives: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub has_error: bool,
    pub error_code: String,
    pub error_message: String,
}

impl TranscriptionResult {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self {
            has_error: true,
            error_code: code.to_string(),
            error_message: message.into(),
            ..Default::default()
        }
    }
}

/// What a backend can do, for capability negotiation before streaming.
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub supports_streaming: bool,
    pub supports_word_timings: bool,
    pub supports_speaker_labels: bool,
    pub supports_custom_models: bool,
    pub languages: Vec<String>,
    pub encodings: Vec<String>,
    pub min_sample_rate: u32,
    pub max_sample_rate: u32,
    pub max_channels: u16,
    pub features: HashMap<String, String>,
}

/// String-keyed backend configuration.
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    pub parameters: HashMap<String, String>,
    pub credentials: HashMap<String, String>,
}

impl BackendConfig {
    pub fn with_param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    pub fn get_str(&self, key: &str, default: &str) -> String {
        self.parameters
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.parameters
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.parameters.get(key).map(String::as_str) {
            Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            _ => default,
        }
    }
}

/// Session-scoped streaming transcription interface.
///
/// A backend is single-threaded within a session: calls run to completion on
/// the caller's thread and each call observes the state left by the previous
/// one. Independent sessions do not share mutable state and may run
/// concurrently.
pub trait SttBackend {
    /// Load models and validate configuration. Fatal errors leave the
    /// backend unusable; the diagnostic is retained for `status()`.
    fn initialize(&mut self, config: &BackendConfig) -> Result<(), BackendError>;

    /// Feed one audio chunk and get the current partial transcript.
    /// Validation and processing failures are reported on the result, and
    /// the session stays usable.
    fn process_audio(
        &mut self,
        chunk: &AudioChunk<'_>,
        options: &TranscriptionOptions,
    ) -> TranscriptionResult;

    /// Decode any residual audio and return the final transcript, then
    /// return the session to idle. Accumulated text is returned even when
    /// the last chunk failed.
    fn finalize(&mut self) -> TranscriptionResult;

    /// Clear session state, keeping loaded weights.
    fn reset(&mut self);

    fn capabilities(&self) -> Capabilities;

    fn is_healthy(&self) -> bool;

    /// Stringly-typed introspection map.
    fn status(&self) -> HashMap<String, String>;

    fn backend_kind(&self) -> &'static str;
}

/// The closed set of known backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    FastConformer,
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::FastConformer => "fastconformer",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "fastconformer" | "nemo" => Some(BackendKind::FastConformer),
            _ => None,
        }
    }
}

pub fn available_backends() -> &'static [&'static str] {
    &["fastconformer"]
}

/// Create and initialize a backend by name.
pub fn create_backend(
    name: &str,
    config: &BackendConfig,
) -> Result<Box<dyn SttBackend>, BackendError> {
    let kind = BackendKind::from_name(name).ok_or_else(|| {
        BackendError::UnknownBackend(name.to_string(), available_backends().join(", "))
    })?;

    log::info!("Creating '{}' backend", kind.name());

    let mut backend: Box<dyn SttBackend> = match kind {
        BackendKind::FastConformer => Box::new(FastConformerBackend::new()),
    };

    backend.initialize(config)?;
    Ok(backend)
}
