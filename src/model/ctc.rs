//! Driver for the CTC FastConformer export.

use ndarray::Array2;
use ort::inputs;
use ort::session::Session;
use ort::value::TensorRef;

use super::{init_session, ModelConfig, ModelError, PaddedSignal};

/// CTC acoustic model session with probed I/O layout.
///
/// The graph consumes `processed_signal [1, mel, T]` plus
/// `processed_signal_length [1]` and produces log-probs `[1, T/R, V+1]` plus
/// the encoded frame count. Exports with a static time dimension (125- and
/// 500-frame variants exist for the same model) are handled transparently:
/// shorter inputs are zero-padded, longer inputs are window-slid.
pub struct CtcModel {
    session: Session,
    signal_input: String,
    length_input: Option<String>,
    logprobs_output: String,
    encoded_len_output: Option<String>,
    static_frames: Option<usize>,
}

impl Drop for CtcModel {
    fn drop(&mut self) {
        log::debug!("Dropping CtcModel");
    }
}

impl CtcModel {
    pub fn new(config: &ModelConfig) -> Result<Self, ModelError> {
        log::info!("Loading CTC model from {:?}...", config.model_path);
        let session = init_session(&config.model_path, config.num_threads)?;

        let input_names: Vec<String> = session.inputs.iter().map(|i| i.name.clone()).collect();
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();

        if input_names.is_empty() || output_names.is_empty() {
            return Err(ModelError::InputNotFound(
                "model has no inputs or outputs".to_string(),
            ));
        }

        let signal_input = input_names
            .iter()
            .find(|n| n.as_str() == "processed_signal")
            .or_else(|| {
                input_names
                    .iter()
                    .find(|n| !n.contains("length") && !n.contains("lens"))
            })
            .cloned()
            .unwrap_or_else(|| input_names[0].clone());

        // Single-input exports exist; the length tensor is only fed when the
        // graph declares it
        let length_input = input_names
            .iter()
            .find(|n| n.as_str() == "processed_signal_length")
            .or_else(|| {
                input_names
                    .iter()
                    .find(|n| n.as_str() != signal_input && (n.contains("length") || n.contains("lens")))
            })
            .cloned();

        let logprobs_output = output_names
            .iter()
            .find(|n| n.as_str() == "logprobs" || n.as_str() == "log_probs")
            .cloned()
            .unwrap_or_else(|| output_names[0].clone());

        let encoded_len_output = output_names
            .iter()
            .find(|n| n.as_str() != logprobs_output && (n.contains("length") || n.contains("encoded")))
            .cloned();

        let static_frames = probe_static_frames(&session, &signal_input, config.num_mel_bins);

        log::info!(
            "CTC model I/O: signal='{}', length={:?}, logprobs='{}', encoded_len={:?}, static_frames={:?}",
            signal_input,
            length_input,
            logprobs_output,
            encoded_len_output,
            static_frames
        );

        Ok(Self {
            session,
            signal_input,
            length_input,
            logprobs_output,
            encoded_len_output,
            static_frames,
        })
    }

    /// Fixed time dimension of a static-shape export, `None` for dynamic
    /// graphs.
    pub fn static_frames(&self) -> Option<usize> {
        self.static_frames
    }

    /// Run the acoustic model over a full feature matrix `[time, mel]`.
    ///
    /// Returns log-probs `[frames_out, vocab+1]` limited to the encoded
    /// length, i.e. padding already excluded.
    pub fn infer(&mut self, features: &Array2<f32>) -> Result<Array2<f32>, ModelError> {
        let frames = features.nrows();
        if frames == 0 {
            return Ok(Array2::zeros((0, 0)));
        }

        match self.static_frames {
            None => {
                let signal = PaddedSignal::from_features(features.view(), None)?;
                self.run_window(&signal)
            }
            Some(t0) if frames <= t0 => {
                let signal = PaddedSignal::from_features(features.view(), Some(t0))?;
                self.run_window(&signal)
            }
            Some(t0) => {
                // Static export shorter than the utterance: slide
                // non-overlapping windows and concatenate the valid outputs
                log::debug!(
                    "Sliding {} frames through a {}-frame static graph",
                    frames,
                    t0
                );

                let mut rows: Vec<f32> = Vec::new();
                let mut vocab_size = 0usize;
                let mut total = 0usize;

                for start in (0..frames).step_by(t0) {
                    let end = (start + t0).min(frames);
                    let window = features.slice(ndarray::s![start..end, ..]);
                    let signal = PaddedSignal::from_features(window, Some(t0))?;
                    let probs = self.run_window(&signal)?;

                    vocab_size = probs.ncols();
                    total += probs.nrows();
                    rows.extend(probs.iter().copied());
                }

                Ok(Array2::from_shape_vec((total, vocab_size), rows)?)
            }
        }
    }

    fn run_window(&mut self, signal: &PaddedSignal) -> Result<Array2<f32>, ModelError> {
        let signal_dyn = signal.data().view().into_dyn();
        let length = ndarray::arr1(&[signal.valid_len() as i64]).into_dyn();

        let run_result = if let Some(length_input) = &self.length_input {
            let model_inputs = inputs![
                self.signal_input.as_str() => TensorRef::from_array_view(signal_dyn.view())?,
                length_input.as_str() => TensorRef::from_array_view(length.view())?,
            ];
            self.session.run(model_inputs)
        } else {
            let model_inputs = inputs![
                self.signal_input.as_str() => TensorRef::from_array_view(signal_dyn.view())?,
            ];
            self.session.run(model_inputs)
        };

        let outputs = match run_result {
            Ok(outputs) => outputs,
            Err(e) => {
                log::error!(
                    "CTC inference failed: signal shape {:?}, valid_len {}: {}",
                    signal.data().shape(),
                    signal.valid_len(),
                    e
                );
                return Err(e.into());
            }
        };

        let log_probs = outputs
            .get(self.logprobs_output.as_str())
            .ok_or_else(|| ModelError::OutputNotFound(self.logprobs_output.clone()))?
            .try_extract_array::<f32>()?
            .to_owned()
            .into_dimensionality::<ndarray::Ix3>()?;

        let time_steps = log_probs.shape()[1];
        let vocab_size = log_probs.shape()[2];

        let encoded_len = match &self.encoded_len_output {
            Some(name) => outputs
                .get(name.as_str())
                .and_then(|v| v.try_extract_array::<i64>().ok())
                .and_then(|arr| arr.as_slice().and_then(|s| s.first().copied()))
                .map(|v| (v.max(0) as usize).min(time_steps))
                .unwrap_or(time_steps),
            None => time_steps,
        };

        log::debug!(
            "CTC forward: logprobs [{}x{}], encoded_len={}",
            time_steps,
            vocab_size,
            encoded_len
        );

        // Anything past encoded_len is padding artifact; drop it here
        let mut valid = Array2::zeros((encoded_len, vocab_size));
        for t in 0..encoded_len {
            for v in 0..vocab_size {
                valid[[t, v]] = log_probs[[0, t, v]];
            }
        }

        Ok(valid)
    }
}

/// Declared time dimension of the signal input: positive means a static
/// export, dynamic dims come back negative.
fn probe_static_frames(session: &Session, signal_input: &str, num_mel_bins: usize) -> Option<usize> {
    let input = session.inputs.iter().find(|i| i.name == signal_input)?;
    let shape = input.input_type.tensor_shape()?;
    if shape.len() != 3 {
        log::warn!(
            "signal input '{}' has rank {} (expected 3)",
            signal_input,
            shape.len()
        );
        return None;
    }

    if shape[1] > 0 && shape[1] as usize != num_mel_bins {
        log::warn!(
            "signal input declares {} mel bins, extractor produces {}",
            shape[1],
            num_mel_bins
        );
    }

    if shape[2] > 0 {
        Some(shape[2] as usize)
    } else {
        None
    }
}
