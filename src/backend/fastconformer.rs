//! ONNX FastConformer-CTC backend.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use crate::backend::{
    AudioChunk, AudioEncoding, BackendConfig, BackendError, Capabilities, SttBackend,
    TranscriptionOptions, TranscriptionResult,
};
use crate::codec;
use crate::decoder;
use crate::features::{CmvnStats, FbankComputer, FbankConfig};
use crate::model::{CacheAwareModel, CtcModel, ModelConfig};
use crate::stream::StreamingBuffer;
use crate::vocab::Vocabulary;

const SAMPLE_RATE: u32 = 16000;
/// Upper bound on buffered audio in the streaming chunker (60 s).
const CHUNKER_CAPACITY: usize = 16000 * 60;
/// Chunk span used when a cache-aware export does not declare one.
const DEFAULT_CHUNK_SAMPLES: usize = 1600;

/// Parsed backend parameters.
#[derive(Debug, Clone)]
struct ParsedConfig {
    model_path: PathBuf,
    vocab_path: PathBuf,
    cmvn_file: String,
    num_threads: usize,
    provider: String,
    blank_id: Option<usize>,
    enable_cache: bool,
}

impl ParsedConfig {
    fn parse(config: &BackendConfig) -> Result<Self, BackendError> {
        let model_path = config.get_str("modelPath", "");
        if model_path.is_empty() {
            return Err(BackendError::MissingConfig("modelPath"));
        }
        let vocab_path = config.get_str("vocabPath", "");
        if vocab_path.is_empty() {
            return Err(BackendError::MissingConfig("vocabPath"));
        }

        Ok(Self {
            model_path: PathBuf::from(model_path),
            vocab_path: PathBuf::from(vocab_path),
            cmvn_file: config.get_str("cmvnFile", "none"),
            num_threads: config.get_int("numThreads", 4).max(0) as usize,
            provider: config.get_str("provider", "CPU"),
            blank_id: config
                .parameters
                .get("blankId")
                .and_then(|v| v.parse().ok()),
            enable_cache: config.get_bool("enableCache", false),
        })
    }
}

enum AcousticModel {
    Ctc(CtcModel),
    CacheAware(CacheAwareModel),
}

/// Mutable per-session state, cleared by `reset()`.
#[derive(Default)]
struct SessionState {
    /// Accumulated decoded samples (offline CTC path re-decodes these).
    samples: Vec<f32>,
    accumulated_text: String,
    confidence_sum: f64,
    num_segments: u32,
    is_active: bool,
    start_time_ms: u64,
    current_time_ms: u64,
    channel_index: i32,
    channel_role: String,
    chunks_processed: u64,
    total_audio_ms: u64,
    total_processing_ms: u64,
}

impl SessionState {
    fn clear(&mut self) {
        *self = SessionState::default();
    }

    fn confidence(&self) -> f64 {
        if self.num_segments > 0 {
            self.confidence_sum / self.num_segments as f64
        } else {
            0.0
        }
    }
}

/// Streaming FastConformer-CTC backend over ONNX Runtime.
///
/// Owns the inference session, vocabulary, CMVN stats, and feature extractor
/// state. Single-threaded per session; independent instances can run
/// concurrently.
pub struct FastConformerBackend {
    config: Option<ParsedConfig>,
    model: Option<AcousticModel>,
    vocab: Option<Vocabulary>,
    fbank: Option<FbankComputer>,
    chunker: Option<StreamingBuffer>,
    state: SessionState,
    init_error: Option<String>,
}

impl FastConformerBackend {
    pub fn new() -> Self {
        Self {
            config: None,
            model: None,
            vocab: None,
            fbank: None,
            chunker: None,
            state: SessionState::default(),
            init_error: None,
        }
    }

    fn try_initialize(&mut self, config: &BackendConfig) -> Result<(), BackendError> {
        let parsed = ParsedConfig::parse(config)?;

        if parsed.provider != "CPU" {
            log::warn!(
                "provider '{}' not available, falling back to CPU",
                parsed.provider
            );
        }

        let model_config = ModelConfig {
            model_path: parsed.model_path.clone(),
            num_threads: parsed.num_threads,
            num_mel_bins: 80,
        };

        let model = if parsed.enable_cache {
            AcousticModel::CacheAware(CacheAwareModel::new(&model_config)?)
        } else {
            AcousticModel::Ctc(CtcModel::new(&model_config)?)
        };

        let vocab = match parsed.blank_id {
            Some(blank_id) => Vocabulary::load_with_blank(&parsed.vocab_path, blank_id)?,
            None => Vocabulary::load(&parsed.vocab_path)?,
        };

        let fbank_config = FbankConfig::default();
        let frame_overlap = fbank_config.frame_length() - fbank_config.frame_shift();
        let mut fbank = FbankComputer::new(fbank_config);

        if parsed.cmvn_file != "none" && !parsed.cmvn_file.is_empty() {
            let stats = CmvnStats::load(parsed.cmvn_file.as_ref(), 80)?;
            fbank.set_cmvn(Some(stats));
        }

        if let AcousticModel::CacheAware(cache_model) = &model {
            // A chunk of N samples yields floor((N + shift/2)/shift) frames;
            // solve N so a static export sees exactly its declared frame count
            let shift = fbank.config().frame_shift();
            let chunk_size = match cache_model.chunk_frames() {
                Some(frames) => frames * shift - shift / 2,
                None => DEFAULT_CHUNK_SAMPLES + frame_overlap,
            };
            let capacity = CHUNKER_CAPACITY.max(chunk_size * 2);
            self.chunker = Some(StreamingBuffer::new(capacity, chunk_size, frame_overlap)?);
        }

        log::info!(
            "FastConformer backend ready: model={:?}, vocab={} tokens, blank_id={}, mode={}",
            parsed.model_path,
            vocab.len(),
            vocab.blank_id(),
            if parsed.enable_cache { "cache-aware" } else { "ctc" }
        );

        self.config = Some(parsed);
        self.model = Some(model);
        self.vocab = Some(vocab);
        self.fbank = Some(fbank);
        Ok(())
    }

    fn validate_chunk(&self, chunk: &AudioChunk<'_>) -> Option<TranscriptionResult> {
        if !chunk.is_frame_aligned() {
            return Some(TranscriptionResult::error(
                "INVALID_CHUNK_SIZE",
                format!(
                    "{} bytes is not a whole number of {}-bit {}-channel frames",
                    chunk.data.len(),
                    chunk.bits_per_sample,
                    chunk.channels
                ),
            ));
        }
        if chunk.encoding != AudioEncoding::Pcm16 {
            return Some(TranscriptionResult::error(
                "INVALID_ENCODING",
                format!(
                    "Only pcm16 encoding is supported, got {}",
                    chunk.encoding.as_str()
                ),
            ));
        }
        if chunk.sample_rate != SAMPLE_RATE {
            return Some(TranscriptionResult::error(
                "INVALID_SAMPLE_RATE",
                format!(
                    "Only {} Hz sample rate is supported, got {}",
                    SAMPLE_RATE, chunk.sample_rate
                ),
            ));
        }
        if chunk.channels != 1 {
            return Some(TranscriptionResult::error(
                "INVALID_CHANNELS",
                format!("Only mono audio is supported, got {}", chunk.channels),
            ));
        }
        None
    }

    /// Decode the session's accumulated audio (offline CTC path).
    fn decode_accumulated(&mut self) -> Result<(), String> {
        let fbank = self.fbank.as_mut().ok_or("feature extractor missing")?;
        let model = self.model.as_mut().ok_or("model missing")?;
        let vocab = self.vocab.as_ref().ok_or("vocabulary missing")?;

        if self.state.samples.len() < fbank.config().frame_length() {
            return Ok(());
        }

        // Re-extract from the start so partials see a consistent dither
        // stream across calls
        fbank.reset();
        let features = fbank.compute(&self.state.samples);
        if features.nrows() == 0 {
            return Ok(());
        }

        let model = match model {
            AcousticModel::Ctc(m) => m,
            AcousticModel::CacheAware(_) => return Err("cache-aware model on offline path".into()),
        };

        let log_probs = model.infer(&features).map_err(|e| e.to_string())?;
        if log_probs.nrows() == 0 {
            return Ok(());
        }

        let (text, confidence) =
            decoder::decode_to_text(log_probs.view(), log_probs.nrows(), vocab);

        log::debug!(
            "Decoded {} frames -> '{}' (confidence {:.3})",
            log_probs.nrows(),
            text,
            confidence
        );

        if !text.is_empty() && text != self.state.accumulated_text {
            self.state.accumulated_text = text;
            self.state.confidence_sum += confidence as f64;
            self.state.num_segments += 1;
        }
        Ok(())
    }

    /// Feed ready chunks through the cache-aware model, appending new text.
    fn decode_streaming(&mut self, flush: bool) -> Result<(), String> {
        let fbank = self.fbank.as_mut().ok_or("feature extractor missing")?;
        let vocab = self.vocab.as_ref().ok_or("vocabulary missing")?;
        let chunker = self.chunker.as_mut().ok_or("chunker missing")?;
        let model = match self.model.as_mut() {
            Some(AcousticModel::CacheAware(m)) => m,
            _ => return Err("cache-aware model missing on streaming path".into()),
        };

        let mut chunk = Vec::new();
        loop {
            let got = if chunker.next_chunk(&mut chunk) {
                true
            } else if flush && chunker.available() > 0 {
                chunker.drain(&mut chunk);
                !chunk.is_empty()
            } else {
                false
            };
            if !got {
                break;
            }

            if chunk.len() < fbank.config().frame_length() {
                continue;
            }

            let features = fbank.compute(&chunk);
            if features.nrows() == 0 {
                continue;
            }

            let log_probs = model.step(&features).map_err(|e| e.to_string())?;
            if log_probs.nrows() == 0 {
                continue;
            }

            let (text, confidence) =
                decoder::decode_to_text(log_probs.view(), log_probs.nrows(), vocab);

            if !text.is_empty() {
                if !self.state.accumulated_text.is_empty() {
                    self.state.accumulated_text.push(' ');
                }
                self.state.accumulated_text.push_str(&text);
                self.state.confidence_sum += confidence as f64;
                self.state.num_segments += 1;
            }
        }

        Ok(())
    }

    fn run_pipeline(&mut self, flush: bool) -> Result<(), String> {
        if self.model.is_none() {
            return Err("model not initialized".into());
        }
        let streaming = matches!(self.model, Some(AcousticModel::CacheAware(_)));
        if streaming {
            self.decode_streaming(flush)
        } else {
            self.decode_accumulated()
        }
    }

    fn build_result(&self, is_final: bool) -> TranscriptionResult {
        let mut result = TranscriptionResult {
            text: self.state.accumulated_text.clone(),
            confidence: self.state.confidence(),
            is_final,
            start_time_ms: self.state.start_time_ms,
            end_time_ms: self.state.current_time_ms,
            detected_language: "en-US".to_string(),
            ..Default::default()
        };

        result
            .metadata
            .insert("backend".to_string(), "fastconformer".to_string());
        if let Some(config) = &self.config {
            result.metadata.insert(
                "model".to_string(),
                config.model_path.display().to_string(),
            );
        }
        result.metadata.insert(
            "channelNumber".to_string(),
            self.state.channel_index.to_string(),
        );
        result
            .metadata
            .insert("channelRole".to_string(), self.state.channel_role.clone());

        result
    }
}

impl Default for FastConformerBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SttBackend for FastConformerBackend {
    fn initialize(&mut self, config: &BackendConfig) -> Result<(), BackendError> {
        if self.model.is_some() {
            return Err(BackendError::AlreadyInitialized);
        }

        match self.try_initialize(config) {
            Ok(()) => {
                self.init_error = None;
                Ok(())
            }
            Err(e) => {
                log::error!("FastConformer backend initialization failed: {}", e);
                self.init_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn process_audio(
        &mut self,
        chunk: &AudioChunk<'_>,
        _options: &TranscriptionOptions,
    ) -> TranscriptionResult {
        if self.model.is_none() {
            return TranscriptionResult::error("NOT_INITIALIZED", "Model not initialized");
        }

        if let Some(error) = self.validate_chunk(chunk) {
            return error;
        }

        let started = Instant::now();

        if !self.state.is_active {
            self.state.is_active = true;
            self.state.start_time_ms = chunk.timestamp_ms;
            if let Some(channel) = &chunk.channel {
                self.state.channel_index = channel.index;
                self.state.channel_role = channel.role.clone();
            } else {
                self.state.channel_index = -1;
            }
        }
        self.state.current_time_ms = chunk.timestamp_ms;

        let samples = match codec::pcm16_to_f32(chunk.data) {
            Ok(samples) => samples,
            Err(e) => return TranscriptionResult::error("INVALID_CHUNK_SIZE", e.to_string()),
        };

        log::trace!(
            "process_audio: {} samples at t={} ms",
            samples.len(),
            chunk.timestamp_ms
        );

        self.state.chunks_processed += 1;
        self.state.total_audio_ms += (samples.len() as u64 * 1000) / SAMPLE_RATE as u64;

        match &mut self.model {
            Some(AcousticModel::Ctc(_)) => self.state.samples.extend_from_slice(&samples),
            Some(AcousticModel::CacheAware(_)) => {
                if let Some(chunker) = self.chunker.as_mut() {
                    chunker.append(&samples);
                }
            }
            None => unreachable!(),
        }

        let outcome = self.run_pipeline(false);
        self.state.total_processing_ms += started.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => self.build_result(false),
            Err(message) => {
                log::error!("processing error: {}", message);
                TranscriptionResult::error(
                    "PROCESSING_ERROR",
                    format!("Error processing audio: {}", message),
                )
            }
        }
    }

    fn finalize(&mut self) -> TranscriptionResult {
        if self.model.is_none() {
            return TranscriptionResult::error("NOT_INITIALIZED", "Model not initialized");
        }

        let started = Instant::now();
        let outcome = self.run_pipeline(true);
        self.state.total_processing_ms += started.elapsed().as_millis() as u64;

        if let Err(message) = outcome {
            // The final result still carries whatever text accumulated
            log::error!("finalization decode failed: {}", message);
        }

        let result = self.build_result(true);
        log::debug!(
            "finalize: '{}' ({} segments)",
            result.text,
            self.state.num_segments
        );

        self.reset();
        result
    }

    fn reset(&mut self) {
        self.state.clear();
        if let Some(fbank) = self.fbank.as_mut() {
            fbank.reset();
        }
        if let Some(chunker) = self.chunker.as_mut() {
            chunker.clear();
        }
        if let Some(AcousticModel::CacheAware(model)) = self.model.as_mut() {
            model.reset();
        }
    }

    fn capabilities(&self) -> Capabilities {
        let mut features = HashMap::new();
        features.insert(
            "provider".to_string(),
            self.config
                .as_ref()
                .map(|c| c.provider.clone())
                .unwrap_or_else(|| "CPU".to_string()),
        );
        features.insert("modelType".to_string(), "FASTCONFORMER_CTC".to_string());
        features.insert("requiresVocab".to_string(), "true".to_string());

        Capabilities {
            supports_streaming: true,
            supports_word_timings: false,
            supports_speaker_labels: false,
            supports_custom_models: true,
            languages: ["en-US", "en-GB", "en-IN", "en-AU"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            encodings: vec!["pcm16".to_string()],
            min_sample_rate: SAMPLE_RATE,
            max_sample_rate: SAMPLE_RATE,
            max_channels: 1,
            features,
        }
    }

    fn is_healthy(&self) -> bool {
        self.model.is_some()
    }

    fn status(&self) -> HashMap<String, String> {
        let mut status = HashMap::new();
        status.insert("healthy".to_string(), self.is_healthy().to_string());
        status.insert("backend".to_string(), "fastconformer".to_string());

        if let Some(config) = &self.config {
            status.insert(
                "model".to_string(),
                config.model_path.display().to_string(),
            );
            status.insert("provider".to_string(), config.provider.clone());
            status.insert(
                "mode".to_string(),
                if config.enable_cache {
                    "cache-aware".to_string()
                } else {
                    "ctc".to_string()
                },
            );
        }
        if let Some(error) = &self.init_error {
            status.insert("initError".to_string(), error.clone());
        }

        status.insert("active".to_string(), self.state.is_active.to_string());
        if self.state.is_active {
            status.insert(
                "segments".to_string(),
                self.state.num_segments.to_string(),
            );
            status.insert(
                "duration_ms".to_string(),
                self.state
                    .current_time_ms
                    .saturating_sub(self.state.start_time_ms)
                    .to_string(),
            );
        }

        status.insert(
            "chunks_processed".to_string(),
            self.state.chunks_processed.to_string(),
        );
        status.insert(
            "total_audio_ms".to_string(),
            self.state.total_audio_ms.to_string(),
        );
        status.insert(
            "total_processing_ms".to_string(),
            self.state.total_processing_ms.to_string(),
        );
        if self.state.total_audio_ms > 0 {
            status.insert(
                "real_time_factor".to_string(),
                format!(
                    "{:.3}",
                    self.state.total_processing_ms as f64 / self.state.total_audio_ms as f64
                ),
            );
        }

        status
    }

    fn backend_kind(&self) -> &'static str {
        "fastconformer"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm16_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_uninitialized_process_returns_error() {
        let mut backend = FastConformerBackend::new();
        let data = pcm16_bytes(&[0; 160]);
        let chunk = AudioChunk::pcm16_mono(&data, 0);
        let result = backend.process_audio(&chunk, &TranscriptionOptions::default());

        assert!(result.has_error);
        assert_eq!(result.error_code, "NOT_INITIALIZED");
        assert!(result.text.is_empty());
    }

    #[test]
    fn test_uninitialized_finalize_returns_error() {
        let mut backend = FastConformerBackend::new();
        let result = backend.finalize();
        assert!(result.has_error);
        assert_eq!(result.error_code, "NOT_INITIALIZED");
    }

    #[test]
    fn test_initialize_requires_model_path() {
        let mut backend = FastConformerBackend::new();
        let config = BackendConfig::default().with_param("vocabPath", "tokens.txt");
        assert!(matches!(
            backend.initialize(&config),
            Err(BackendError::MissingConfig("modelPath"))
        ));
        assert!(!backend.is_healthy());
    }

    #[test]
    fn test_initialize_requires_vocab_path() {
        let mut backend = FastConformerBackend::new();
        let config = BackendConfig::default().with_param("modelPath", "model.onnx");
        assert!(matches!(
            backend.initialize(&config),
            Err(BackendError::MissingConfig("vocabPath"))
        ));
    }

    #[test]
    fn test_initialize_missing_model_records_diagnostic() {
        let mut backend = FastConformerBackend::new();
        let config = BackendConfig::default()
            .with_param("modelPath", "/nonexistent/model.onnx")
            .with_param("vocabPath", "/nonexistent/tokens.txt");

        assert!(backend.initialize(&config).is_err());
        assert!(!backend.is_healthy());

        let status = backend.status();
        assert_eq!(status.get("healthy").map(String::as_str), Some("false"));
        assert!(status.contains_key("initError"));
    }

    #[test]
    fn test_capabilities_canonical_values() {
        let backend = FastConformerBackend::new();
        let caps = backend.capabilities();

        assert!(caps.supports_streaming);
        assert!(!caps.supports_word_timings);
        assert!(!caps.supports_speaker_labels);
        assert_eq!(caps.encodings, vec!["pcm16"]);
        assert_eq!(caps.min_sample_rate, 16000);
        assert_eq!(caps.max_sample_rate, 16000);
        assert_eq!(caps.max_channels, 1);
        assert!(caps.languages.contains(&"en-US".to_string()));
        assert_eq!(caps.languages.len(), 4);
    }

    #[test]
    fn test_status_reflects_idle_session() {
        let backend = FastConformerBackend::new();
        let status = backend.status();
        assert_eq!(status.get("active").map(String::as_str), Some("false"));
        assert_eq!(status.get("backend").map(String::as_str), Some("fastconformer"));
    }
}
