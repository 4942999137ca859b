//! End-to-end backend tests.
//!
//! Model-dependent cases follow the usual convention: they skip with a
//! notice when the model directory or audio fixtures are absent.

use std::path::PathBuf;
use std::sync::Once;

use conformer_stt::backend::{
    create_backend, AudioChunk, BackendConfig, BackendError, FastConformerBackend, SttBackend,
    TranscriptionOptions,
};

static INIT_LOGGER: Once = Once::new();

fn init_logger() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn model_config() -> Option<BackendConfig> {
    let model_path = PathBuf::from("models/fastconformer/model.onnx");
    let vocab_path = PathBuf::from("models/fastconformer/tokens.txt");

    if !model_path.exists() || !vocab_path.exists() {
        eprintln!(
            "Skipping test: model not found at {:?} / {:?}",
            model_path, vocab_path
        );
        return None;
    }

    Some(
        BackendConfig::default()
            .with_param("modelPath", model_path.display().to_string())
            .with_param("vocabPath", vocab_path.display().to_string()),
    )
}

fn fixture_pcm16(name: &str) -> Option<Vec<u8>> {
    let wav_path = PathBuf::from("samples").join(name);
    if !wav_path.exists() {
        eprintln!("Skipping test: audio not found at {:?}", wav_path);
        return None;
    }
    Some(conformer_stt::audio::read_wav_pcm16(&wav_path).expect("fixture must be canonical WAV"))
}

fn silence_pcm16(seconds: f32) -> Vec<u8> {
    vec![0u8; (seconds * 16000.0) as usize * 2]
}

#[test]
fn test_double_initialize_rejected() {
    init_logger();
    let Some(config) = model_config() else {
        return;
    };

    let mut backend = FastConformerBackend::new();
    backend.initialize(&config).unwrap();
    assert!(matches!(
        backend.initialize(&config),
        Err(BackendError::AlreadyInitialized)
    ));
    // Session stays healthy after the rejected second init
    assert!(backend.is_healthy());
}

#[test]
fn test_empty_audio_finalizes_clean() {
    init_logger();
    let Some(config) = model_config() else {
        return;
    };

    let mut backend = create_backend("fastconformer", &config).unwrap();
    let result = backend.finalize();

    assert!(!result.has_error);
    assert!(result.is_final);
    assert!(result.text.is_empty());
}

#[test]
fn test_silence_yields_empty_text() {
    init_logger();
    let Some(config) = model_config() else {
        return;
    };

    let mut backend = create_backend("fastconformer", &config).unwrap();
    let silence = silence_pcm16(2.0);
    let options = TranscriptionOptions::default();

    let partial = backend.process_audio(&AudioChunk::pcm16_mono(&silence, 0), &options);
    assert!(!partial.has_error, "{}", partial.error_message);
    assert!(partial.text.is_empty());

    let result = backend.finalize();
    assert!(!result.has_error);
    assert!(result.text.is_empty());
}

#[test]
fn test_subframe_audio_produces_empty_partial() {
    init_logger();
    let Some(config) = model_config() else {
        return;
    };

    let mut backend = create_backend("fastconformer", &config).unwrap();
    // 10 ms of audio: below one 25 ms feature frame, inference must be skipped
    let tiny = silence_pcm16(0.01);
    let result = backend.process_audio(
        &AudioChunk::pcm16_mono(&tiny, 0),
        &TranscriptionOptions::default(),
    );

    assert!(!result.has_error);
    assert!(result.text.is_empty());
    assert!(!result.is_final);
}

#[test]
fn test_librispeech_regression_prefix() {
    init_logger();
    let (Some(config), Some(pcm)) = (model_config(), fixture_pcm16("1995-1837-0001.wav")) else {
        return;
    };

    let mut backend = create_backend("fastconformer", &config).unwrap();
    let options = TranscriptionOptions::default();

    let partial = backend.process_audio(&AudioChunk::pcm16_mono(&pcm, 0), &options);
    assert!(!partial.has_error, "{}", partial.error_message);

    let result = backend.finalize();
    assert!(!result.has_error);
    assert!(result.is_final);

    let expected_prefix = "it was the first great sorrow of his life";
    let normalized = result.text.to_lowercase();
    assert!(
        normalized.starts_with(expected_prefix),
        "\nExpected prefix: '{}'\nActual: '{}'",
        expected_prefix,
        result.text
    );
    assert!(result.confidence > 0.5);
}

#[test]
fn test_chunked_matches_one_shot() {
    init_logger();
    let (Some(config), Some(pcm)) = (model_config(), fixture_pcm16("1995-1837-0001.wav")) else {
        return;
    };

    let options = TranscriptionOptions::default();

    let mut one_shot = create_backend("fastconformer", &config).unwrap();
    one_shot.process_audio(&AudioChunk::pcm16_mono(&pcm, 0), &options);
    let whole = one_shot.finalize();

    let mut chunked = create_backend("fastconformer", &config).unwrap();
    let chunk_bytes = 3200; // 100 ms
    let mut timestamp = 0u64;
    for chunk in pcm.chunks(chunk_bytes) {
        let result = chunked.process_audio(&AudioChunk::pcm16_mono(chunk, timestamp), &options);
        assert!(!result.has_error, "{}", result.error_message);
        timestamp += 100;
    }
    let split = chunked.finalize();

    // Streams may disagree only around the finalization boundary; compare
    // word level with a small tolerance
    let whole_words: Vec<&str> = whole.text.split_whitespace().collect();
    let split_words: Vec<&str> = split.text.split_whitespace().collect();

    let common = whole_words
        .iter()
        .zip(split_words.iter())
        .take_while(|(a, b)| a == b)
        .count();

    assert!(
        whole_words.len() - common <= 2 && split_words.len() - common <= 2,
        "chunked decode diverged mid-utterance:\n  one-shot: {}\n  chunked:  {}",
        whole.text,
        split.text
    );
}

#[test]
fn test_reset_reproduces_identical_output() {
    init_logger();
    let (Some(config), Some(pcm)) = (model_config(), fixture_pcm16("1995-1837-0001.wav")) else {
        return;
    };

    let mut backend = create_backend("fastconformer", &config).unwrap();
    let options = TranscriptionOptions::default();

    backend.process_audio(&AudioChunk::pcm16_mono(&pcm, 0), &options);
    let first = backend.finalize();

    // finalize() already reset the session; run the same input again
    backend.process_audio(&AudioChunk::pcm16_mono(&pcm, 0), &options);
    let second = backend.finalize();

    assert_eq!(first.text, second.text);
    assert_eq!(first.confidence, second.confidence);
}

#[test]
fn test_telephony_ulaw_upsampled_transcribes() {
    init_logger();
    let (Some(config), Some(pcm)) = (model_config(), fixture_pcm16("1995-1837-0001.wav")) else {
        return;
    };

    use conformer_stt::codec;

    // Simulate a telephony source: 16 kHz reference downmixed by dropping
    // every other sample to 8 kHz, µ-law transcoded, then fed back through
    // the documented upsample path
    let samples = codec::pcm16_to_f32(&pcm).unwrap();
    let telephony: Vec<f32> = samples.iter().step_by(2).copied().collect();
    let ulaw = codec::encode_g711_ulaw(&telephony);
    let restored = codec::resample(&codec::g711_ulaw_to_f32(&ulaw), 8000, 16000).unwrap();

    let restored_pcm: Vec<u8> = restored
        .iter()
        .flat_map(|&s| (((s * 32767.0).clamp(-32768.0, 32767.0)) as i16).to_le_bytes())
        .collect();

    let options = TranscriptionOptions::default();

    let mut reference = create_backend("fastconformer", &config).unwrap();
    reference.process_audio(&AudioChunk::pcm16_mono(&pcm, 0), &options);
    let expected = reference.finalize();

    let mut backend = create_backend("fastconformer", &config).unwrap();
    backend.process_audio(&AudioChunk::pcm16_mono(&restored_pcm, 0), &options);
    let result = backend.finalize();

    assert!(!result.text.is_empty(), "telephony path produced no text");

    let expected_words: Vec<&str> = expected.text.split_whitespace().collect();
    let result_words: Vec<&str> = result.text.split_whitespace().collect();
    let matching = expected_words
        .iter()
        .filter(|w| result_words.contains(w))
        .count();

    assert!(
        matching as f32 / expected_words.len() as f32 >= 0.9,
        "telephony accuracy too low: {}/{} words\n  expected: {}\n  actual:   {}",
        matching,
        expected_words.len(),
        expected.text,
        result.text
    );
}

#[test]
fn test_feature_stats_match_reference_extractor() {
    init_logger();
    let Some(pcm) = fixture_pcm16("1995-1837-0001.wav") else {
        return;
    };

    use conformer_stt::features::{FbankComputer, FbankConfig};

    let samples = conformer_stt::codec::pcm16_to_f32(&pcm).unwrap();
    let mut fbank = FbankComputer::new(FbankConfig::default());
    let features = fbank.compute(&samples);
    assert!(features.nrows() > 0);

    let count = features.len() as f64;
    let mean = features.iter().map(|&v| v as f64).sum::<f64>() / count;
    let var = features
        .iter()
        .map(|&v| (v as f64 - mean).powi(2))
        .sum::<f64>()
        / count;
    let std = var.sqrt();
    let min = features.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = features.iter().cloned().fold(f32::NEG_INFINITY, f32::max);

    // Reference mel extractor stats for this utterance
    assert!((mean - -3.91).abs() < 0.05, "mean {} drifted", mean);
    assert!((std - 2.77).abs() < 0.05, "std {} drifted", std);
    assert!((min - -10.73).abs() < 0.5, "min {} drifted", min);
    assert!((max - 6.68).abs() < 0.5, "max {} drifted", max);
}

#[test]
fn test_features_match_reference_dump() {
    init_logger();
    let Some(pcm) = fixture_pcm16("1995-1837-0001.wav") else {
        return;
    };
    let dump_path = std::path::PathBuf::from("samples/1995-1837-0001.fbank.bin");
    if !dump_path.exists() {
        eprintln!("Skipping test: reference dump not found at {:?}", dump_path);
        return;
    }

    use conformer_stt::features::{FbankComputer, FbankConfig};

    // Raw little-endian f32 values in [time, mel] order, dumped by the
    // reference extractor over the same audio with dither disabled
    let raw = std::fs::read(&dump_path).unwrap();
    let reference: Vec<f32> = raw
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();

    let samples = conformer_stt::codec::pcm16_to_f32(&pcm).unwrap();
    let mut fbank = FbankComputer::new(FbankConfig {
        dither: 0.0,
        ..FbankConfig::default()
    });
    let features = fbank.compute(&samples);

    assert_eq!(
        features.len(),
        reference.len(),
        "frame grid mismatch: {} vs {} values",
        features.len(),
        reference.len()
    );

    for (i, (&got, &want)) in features.iter().zip(reference.iter()).enumerate() {
        assert!(
            (got - want).abs() < 1e-3,
            "feature {} diverged: {} vs reference {}",
            i,
            got,
            want
        );
    }
}

#[test]
fn test_top1_logit_parity_with_reference() {
    init_logger();
    let (Some(_config), Some(pcm)) = (model_config(), fixture_pcm16("1995-1837-0001.wav")) else {
        return;
    };
    let dump_path = std::path::PathBuf::from("samples/1995-1837-0001.top1.txt");
    if !dump_path.exists() {
        eprintln!("Skipping test: logit dump not found at {:?}", dump_path);
        return;
    }

    use conformer_stt::features::{FbankComputer, FbankConfig};
    use conformer_stt::model::{CtcModel, ModelConfig};

    // Whitespace-separated top-1 token ids per output frame from the
    // reference pipeline
    let reference: Vec<usize> = std::fs::read_to_string(&dump_path)
        .unwrap()
        .split_whitespace()
        .map(|tok| tok.parse().unwrap())
        .collect();

    let mut model = CtcModel::new(&ModelConfig {
        model_path: PathBuf::from("models/fastconformer/model.onnx"),
        ..ModelConfig::default()
    })
    .unwrap();

    let samples = conformer_stt::codec::pcm16_to_f32(&pcm).unwrap();
    let mut fbank = FbankComputer::new(FbankConfig::default());
    let features = fbank.compute(&samples);
    let log_probs = model.infer(&features).unwrap();

    let frames = log_probs.nrows().min(reference.len());
    assert!(frames > 0);

    let mut matching = 0usize;
    for t in 0..frames {
        let row = log_probs.row(t);
        let mut best = f32::NEG_INFINITY;
        let mut best_id = 0usize;
        for (v, &p) in row.iter().enumerate() {
            if p > best {
                best = p;
                best_id = v;
            }
        }
        if best_id == reference[t] {
            matching += 1;
        }
    }

    assert!(
        matching as f32 / frames as f32 >= 0.95,
        "top-1 parity too low: {}/{} frames",
        matching,
        frames
    );
}

#[test]
fn test_log_probs_are_normalized_and_in_range() {
    init_logger();
    let (Some(_config), Some(pcm)) = (model_config(), fixture_pcm16("1995-1837-0001.wav")) else {
        return;
    };

    use conformer_stt::features::{FbankComputer, FbankConfig};
    use conformer_stt::model::{CtcModel, ModelConfig};
    use conformer_stt::vocab::Vocabulary;

    let mut model = CtcModel::new(&ModelConfig {
        model_path: PathBuf::from("models/fastconformer/model.onnx"),
        ..ModelConfig::default()
    })
    .unwrap();
    let vocab = Vocabulary::load(&PathBuf::from("models/fastconformer/tokens.txt")).unwrap();

    let samples = conformer_stt::codec::pcm16_to_f32(&pcm).unwrap();
    let mut fbank = FbankComputer::new(FbankConfig::default());
    let features = fbank.compute(&samples);

    let log_probs = model.infer(&features).unwrap();
    assert!(log_probs.nrows() > 0);
    // V+1 classes: the full vocabulary plus the blank
    assert_eq!(log_probs.ncols(), vocab.len() + 1);

    for row in log_probs.rows() {
        let mut best = f32::NEG_INFINITY;
        let mut best_id = 0usize;
        for (v, &p) in row.iter().enumerate() {
            assert!(p <= 1e-4, "log-prob {} above zero", p);
            if p > best {
                best = p;
                best_id = v;
            }
        }
        assert!(best_id <= vocab.blank_id());
    }
}

#[test]
fn test_wrong_format_chunks_rejected_and_recoverable() {
    init_logger();
    let Some(config) = model_config() else {
        return;
    };

    let mut backend = create_backend("fastconformer", &config).unwrap();
    let options = TranscriptionOptions::default();
    let data = silence_pcm16(0.1);

    let mut chunk = AudioChunk::pcm16_mono(&data, 0);
    chunk.sample_rate = 8000;
    let result = backend.process_audio(&chunk, &options);
    assert!(result.has_error);
    assert_eq!(result.error_code, "INVALID_SAMPLE_RATE");

    let mut chunk = AudioChunk::pcm16_mono(&data, 0);
    chunk.channels = 2;
    let result = backend.process_audio(&chunk, &options);
    assert!(result.has_error);
    assert_eq!(result.error_code, "INVALID_CHANNELS");

    let mut chunk = AudioChunk::pcm16_mono(&data, 0);
    chunk.encoding = conformer_stt::backend::AudioEncoding::Ulaw;
    let result = backend.process_audio(&chunk, &options);
    assert!(result.has_error);
    assert_eq!(result.error_code, "INVALID_ENCODING");

    // Rejected chunks must not poison the session
    let result = backend.process_audio(&AudioChunk::pcm16_mono(&data, 0), &options);
    assert!(!result.has_error, "{}", result.error_message);
}
