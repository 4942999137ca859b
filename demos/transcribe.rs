use std::path::PathBuf;
use std::time::Instant;

use conformer_stt::backend::{
    create_backend, AudioChunk, BackendConfig, SttBackend, TranscriptionOptions,
};

fn get_audio_duration(path: &PathBuf) -> Result<f64, Box<dyn std::error::Error>> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    let duration = reader.duration() as f64 / spec.sample_rate as f64;
    Ok(duration)
}

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

    let audio_duration = get_audio_duration(&wav_path)?;
    println!("Audio duration: {:.2}s", audio_duration);

    let config = BackendConfig::default()
        .with_param("modelPath", model_path.display().to_string())
        .with_param("vocabPath", vocab_path.display().to_string());

    println!("Loading model: {:?}", model_path);
    let load_start = Instant::now();
    let mut backend = create_backend("fastconformer", &config)?;
    println!("Model loaded in {:.2?}", load_start.elapsed());

    println!("Transcribing file: {:?}", wav_path);
    let pcm = conformer_stt::audio::read_wav_pcm16(&wav_path)?;

    let transcribe_start = Instant::now();
    let partial = backend.process_audio(
        &AudioChunk::pcm16_mono(&pcm, 0),
        &TranscriptionOptions::default(),
    );
    if partial.has_error {
        return Err(format!("{}: {}", partial.error_code, partial.error_message).into());
    }

    let result = backend.finalize();
    let transcribe_duration = transcribe_start.elapsed();
    println!("Transcription completed in {:.2?}", transcribe_duration);

    let speedup_factor = audio_duration / transcribe_duration.as_secs_f64();
    println!(
        "Real-time speedup: {:.2}x faster than real-time",
        speedup_factor
    );

    println!("Transcription result:");
    println!("{}", result.text);
    println!("Confidence: {:.3}", result.confidence);

    Ok(())
}
