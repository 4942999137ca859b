//! # conformer-stt
//!
//! A low-latency streaming speech-to-text library wrapping FastConformer-CTC
//! acoustic models exported to ONNX.
//!
//! The pipeline runs entirely on the caller's thread: telephony codec
//! decoding, 80-bin log-mel feature extraction, fixed-shape ONNX inference,
//! and greedy CTC decoding with SentencePiece detokenization. Real-time
//! factor is well below 1x on CPU for the canonical models.
//!
//! ## Features
//!
//! - **Streaming API**: feed audio chunks, receive partial and final
//!   transcripts through a uniform backend interface
//! - **Telephony codecs**: PCM16/PCM8 and G.711 µ-law/A-law input with
//!   channel splitting and 8 kHz → 16 kHz upsampling
//! - **Training-compatible features**: log-mel extraction numerically
//!   matching the NeMo preprocessor the models were trained with
//! - **Probed model shapes**: dynamic, 125-frame, and 500-frame CTC exports
//!   plus cache-aware streaming exports, detected from the graph at load
//!
//! ## Model Format Requirements
//!
//! A model directory provides:
//! - `model.onnx` — the exported acoustic graph
//! - `tokens.txt` — one token per line in id order; the CTC blank is not
//!   listed (its id equals the line count)
//! - `global_cmvn.stats` — optional per-feature normalization stats
//!
//! ## Quick Start
//!
//! ```ignore
//! use conformer_stt::backend::{create_backend, AudioChunk, BackendConfig, TranscriptionOptions};
//!
//! let config = BackendConfig::default()
//!     .with_param("modelPath", "models/fastconformer/model.onnx")
//!     .with_param("vocabPath", "models/fastconformer/tokens.txt");
//!
//! let mut backend = create_backend("fastconformer", &config)?;
//!
//! let pcm = conformer_stt::audio::read_wav_pcm16("audio.wav".as_ref())?;
//! let partial = backend.process_audio(
//!     &AudioChunk::pcm16_mono(&pcm, 0),
//!     &TranscriptionOptions::default(),
//! );
//! let result = backend.finalize();
//! println!("{} (confidence {:.2})", result.text, result.confidence);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Audio Requirements
//!
//! The acoustic core consumes mono 16 kHz PCM16. Stereo and telephony-rate
//! sources go through [`codec`] first for channel splitting and upsampling.

pub mod audio;
pub mod backend;
pub mod codec;
pub mod decoder;
pub mod features;
pub mod model;
pub mod stream;
pub mod vocab;

pub use backend::{
    create_backend, AudioChunk, AudioEncoding, BackendConfig, BackendError, Capabilities,
    FastConformerBackend, SttBackend, TranscriptionOptions, TranscriptionResult,
};
