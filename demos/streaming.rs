use std::path::PathBuf;

use conformer_stt::backend::{
    create_backend, AudioChunk, BackendConfig, SttBackend, TranscriptionOptions,
};

const CHUNK_MS: usize = 100;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let positional: Vec<&String> = args
        .iter()
        .skip(1)
        .filter(|a| !a.starts_with("--"))
        .collect();

    let model_path = PathBuf::from(
        positional
            .first()
            .map(|s| s.as_str())
            .unwrap_or("models/fastconformer/model.onnx"),
    );
    let vocab_path = PathBuf::from(
        positional
            .get(1)
            .map(|s| s.as_str())
            .unwrap_or("models/fastconformer/tokens.txt"),
    );
    let wav_path = PathBuf::from(
        positional
            .get(2)
            .map(|s| s.as_str())
            .unwrap_or("samples/1995-1837-0001.wav"),
    );

    let config = BackendConfig::default()
        .with_param("modelPath", model_path.display().to_string())
        .with_param("vocabPath", vocab_path.display().to_string());

    println!("Loading model: {:?}", model_path);
    let mut backend = create_backend("fastconformer", &config)?;

    let pcm = conformer_stt::audio::read_wav_pcm16(&wav_path)?;
    let chunk_bytes = CHUNK_MS * 16 * 2; // 16 samples/ms at 2 bytes each

    println!(
        "Feeding {} bytes in {} ms chunks...",
        pcm.len(),
        CHUNK_MS
    );

    let options = TranscriptionOptions::default();
    let mut timestamp_ms = 0u64;
    let mut last_partial = String::new();

    for chunk in pcm.chunks(chunk_bytes) {
        let result = backend.process_audio(&AudioChunk::pcm16_mono(chunk, timestamp_ms), &options);
        if result.has_error {
            eprintln!(
                "chunk at {} ms failed: {}: {}",
                timestamp_ms, result.error_code, result.error_message
            );
        } else if result.text != last_partial {
            println!("[{:>6} ms] {}", timestamp_ms, result.text);
            last_partial = result.text;
        }
        timestamp_ms += CHUNK_MS as u64;
    }

    let final_result = backend.finalize();
    println!("--");
    println!("Final: {}", final_result.text);
    println!("Confidence: {:.3}", final_result.confidence);

    for (key, value) in backend.status() {
        println!("  {} = {}", key, value);
    }

    Ok(())
}
