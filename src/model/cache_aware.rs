//! Driver for the cache-aware streaming FastConformer export.

use ndarray::{Array2, ArrayD, IxDyn};
use ort::inputs;
use ort::session::Session;
use ort::value::TensorRef;

use super::{init_session, ModelConfig, ModelError, PaddedSignal};

const SIGNAL_INPUT: &str = "processed_signal";
const LENGTH_INPUT: &str = "processed_signal_length";
const CACHE_CHANNEL_INPUT: &str = "cache_last_channel";
const CACHE_TIME_INPUT: &str = "cache_last_time";
const CACHE_CHANNEL_LEN_INPUT: &str = "cache_last_channel_len";

/// Streaming conformer session that carries attention caches between chunks.
///
/// The two cache tensors are opaque: their shapes depend on the export
/// (layers, hidden size, attention context), so they are sized from the
/// graph's declared input shapes at load, zeroed at reset, and overwritten
/// from the matching outputs after every step. This driver only works with
/// graphs that declare the cache inputs; it is a separate initialization
/// mode, not a fallback for the plain CTC export.
pub struct CacheAwareModel {
    session: Session,
    logprobs_output: String,
    encoded_len_output: Option<String>,
    cache_channel_output: String,
    cache_time_output: String,
    cache_channel_len_output: Option<String>,
    cache_last_channel: ArrayD<f32>,
    cache_last_time: ArrayD<f32>,
    cache_last_channel_len: Option<i64>,
    chunk_frames: Option<usize>,
}

impl Drop for CacheAwareModel {
    fn drop(&mut self) {
        log::debug!("Dropping CacheAwareModel");
    }
}

impl CacheAwareModel {
    pub fn new(config: &ModelConfig) -> Result<Self, ModelError> {
        log::info!(
            "Loading cache-aware streaming model from {:?}...",
            config.model_path
        );
        let session = init_session(&config.model_path, config.num_threads)?;

        for required in [SIGNAL_INPUT, LENGTH_INPUT, CACHE_CHANNEL_INPUT, CACHE_TIME_INPUT] {
            if !session.inputs.iter().any(|i| i.name == required) {
                return Err(ModelError::InputNotFound(format!(
                    "'{}' (graph is not a cache-aware export)",
                    required
                )));
            }
        }

        let cache_last_channel = zeroed_cache(&session, CACHE_CHANNEL_INPUT)?;
        let cache_last_time = zeroed_cache(&session, CACHE_TIME_INPUT)?;
        let cache_last_channel_len = session
            .inputs
            .iter()
            .any(|i| i.name == CACHE_CHANNEL_LEN_INPUT)
            .then_some(0i64);

        log::info!(
            "Cache tensors: channel {:?}, time {:?}, len input: {}",
            cache_last_channel.shape(),
            cache_last_time.shape(),
            cache_last_channel_len.is_some()
        );

        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();

        let logprobs_output = output_names
            .iter()
            .find(|n| n.as_str() == "logprobs" || n.as_str() == "log_probs")
            .cloned()
            .unwrap_or_else(|| output_names[0].clone());

        let encoded_len_output = output_names
            .iter()
            .find(|n| n.contains("encoded") && n.contains("len"))
            .cloned();

        let cache_channel_output = find_cache_output(&output_names, CACHE_CHANNEL_INPUT, 2)?;
        let cache_time_output = find_cache_output(&output_names, CACHE_TIME_INPUT, 3)?;
        let cache_channel_len_output = if cache_last_channel_len.is_some() {
            find_cache_output(&output_names, CACHE_CHANNEL_LEN_INPUT, 4).ok()
        } else {
            None
        };

        let chunk_frames = session
            .inputs
            .iter()
            .find(|i| i.name == SIGNAL_INPUT)
            .and_then(|i| i.input_type.tensor_shape())
            .filter(|shape| shape.len() == 3 && shape[2] > 0)
            .map(|shape| shape[2] as usize);

        log::info!(
            "Cache-aware I/O: logprobs='{}', caches=('{}', '{}'), chunk_frames={:?}",
            logprobs_output,
            cache_channel_output,
            cache_time_output,
            chunk_frames
        );

        Ok(Self {
            session,
            logprobs_output,
            encoded_len_output,
            cache_channel_output,
            cache_time_output,
            cache_channel_len_output,
            cache_last_channel,
            cache_last_time,
            cache_last_channel_len,
            chunk_frames,
        })
    }

    /// Fixed chunk size (in feature frames) declared by the export, if any.
    pub fn chunk_frames(&self) -> Option<usize> {
        self.chunk_frames
    }

    /// Zero the caches, forgetting all acoustic context.
    pub fn reset(&mut self) {
        self.cache_last_channel.fill(0.0);
        self.cache_last_time.fill(0.0);
        if let Some(len) = self.cache_last_channel_len.as_mut() {
            *len = 0;
        }
        log::debug!("Cache-aware model caches reset");
    }

    /// Run one streaming step over a feature chunk `[time, mel]` and fold the
    /// new caches back into the session state.
    pub fn step(&mut self, features: &Array2<f32>) -> Result<Array2<f32>, ModelError> {
        if features.nrows() == 0 {
            return Ok(Array2::zeros((0, 0)));
        }

        let signal = PaddedSignal::from_features(features.view(), self.chunk_frames)?;
        let signal_dyn = signal.data().view().into_dyn();
        let length = ndarray::arr1(&[signal.valid_len() as i64]).into_dyn();
        let cache_len = ndarray::arr1(&[self.cache_last_channel_len.unwrap_or(0)]).into_dyn();

        let (log_probs, encoded_len, new_channel, new_time, new_len) = {
            let run_result = if self.cache_last_channel_len.is_some() {
                let model_inputs = inputs![
                    SIGNAL_INPUT => TensorRef::from_array_view(signal_dyn.view())?,
                    LENGTH_INPUT => TensorRef::from_array_view(length.view())?,
                    CACHE_CHANNEL_INPUT => TensorRef::from_array_view(self.cache_last_channel.view())?,
                    CACHE_TIME_INPUT => TensorRef::from_array_view(self.cache_last_time.view())?,
                    CACHE_CHANNEL_LEN_INPUT => TensorRef::from_array_view(cache_len.view())?,
                ];
                self.session.run(model_inputs)
            } else {
                let model_inputs = inputs![
                    SIGNAL_INPUT => TensorRef::from_array_view(signal_dyn.view())?,
                    LENGTH_INPUT => TensorRef::from_array_view(length.view())?,
                    CACHE_CHANNEL_INPUT => TensorRef::from_array_view(self.cache_last_channel.view())?,
                    CACHE_TIME_INPUT => TensorRef::from_array_view(self.cache_last_time.view())?,
                ];
                self.session.run(model_inputs)
            };

            let outputs = match run_result {
                Ok(outputs) => outputs,
                Err(e) => {
                    log::error!(
                        "cache-aware step failed: signal {:?}, valid_len {}, caches {:?}/{:?}: {}",
                        signal.data().shape(),
                        signal.valid_len(),
                        self.cache_last_channel.shape(),
                        self.cache_last_time.shape(),
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

            let encoded_len = match &self.encoded_len_output {
                Some(name) => outputs
                    .get(name.as_str())
                    .and_then(|v| v.try_extract_array::<i64>().ok())
                    .and_then(|arr| arr.as_slice().and_then(|s| s.first().copied()))
                    .map(|v| (v.max(0) as usize).min(time_steps))
                    .unwrap_or(time_steps),
                None => time_steps,
            };

            // Fold the new caches into session state before the outputs drop
            let new_channel = outputs
                .get(self.cache_channel_output.as_str())
                .ok_or_else(|| ModelError::OutputNotFound(self.cache_channel_output.clone()))?
                .try_extract_array::<f32>()?
                .to_owned();
            let new_time = outputs
                .get(self.cache_time_output.as_str())
                .ok_or_else(|| ModelError::OutputNotFound(self.cache_time_output.clone()))?
                .try_extract_array::<f32>()?
                .to_owned();

            let new_len = self.cache_channel_len_output.as_ref().and_then(|name| {
                outputs
                    .get(name.as_str())
                    .and_then(|v| v.try_extract_array::<i64>().ok())
                    .and_then(|arr| arr.as_slice().and_then(|s| s.first().copied()))
            });

            (log_probs, encoded_len, new_channel, new_time, new_len)
        };

        let vocab_size = log_probs.shape()[2];

        self.update_caches(new_channel, new_time, new_len);

        let mut valid = Array2::zeros((encoded_len, vocab_size));
        for t in 0..encoded_len {
            for v in 0..vocab_size {
                valid[[t, v]] = log_probs[[0, t, v]];
            }
        }

        Ok(valid)
    }

    fn update_caches(
        &mut self,
        new_channel: ArrayD<f32>,
        new_time: ArrayD<f32>,
        new_len: Option<i64>,
    ) {
        if new_channel.len() == self.cache_last_channel.len() {
            self.cache_last_channel = new_channel;
        } else {
            log::warn!(
                "channel cache output {:?} does not match state {:?}; keeping previous cache",
                new_channel.shape(),
                self.cache_last_channel.shape()
            );
        }

        if new_time.len() == self.cache_last_time.len() {
            self.cache_last_time = new_time;
        } else {
            log::warn!(
                "time cache output {:?} does not match state {:?}; keeping previous cache",
                new_time.shape(),
                self.cache_last_time.shape()
            );
        }

        if let (Some(state), Some(len)) = (self.cache_last_channel_len.as_mut(), new_len) {
            *state = len;
        }
    }
}

/// Zero-filled cache tensor sized from the graph's declared input shape,
/// dynamic dims (batch) forced to 1.
fn zeroed_cache(session: &Session, input_name: &str) -> Result<ArrayD<f32>, ModelError> {
    let input = session
        .inputs
        .iter()
        .find(|i| i.name == input_name)
        .ok_or_else(|| ModelError::InputNotFound(input_name.to_string()))?;

    let shape = input
        .input_type
        .tensor_shape()
        .ok_or_else(|| ModelError::TensorShape(input_name.to_string()))?;

    let dims: Vec<usize> = shape
        .iter()
        .map(|&d| if d > 0 { d as usize } else { 1 })
        .collect();

    Ok(ArrayD::zeros(IxDyn(&dims)))
}

/// Match a cache output to its input by name stem, falling back to position.
fn find_cache_output(
    output_names: &[String],
    input_name: &str,
    fallback_index: usize,
) -> Result<String, ModelError> {
    output_names
        .iter()
        .find(|n| {
            // "cache_last_channel" must not claim "cache_last_channel_len_next"
            n.starts_with(input_name) && !n[input_name.len()..].starts_with("_len")
        })
        .or_else(|| output_names.get(fallback_index))
        .cloned()
        .ok_or_else(|| ModelError::OutputNotFound(format!("cache output for '{}'", input_name)))
}
