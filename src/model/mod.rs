//! ONNX acoustic model drivers.
//!
//! Two initialization modes exist for the FastConformer family:
//! [`ctc::CtcModel`] drives the plain CTC export (dynamic or fixed time
//! dimension, probed from the graph), and [`cache_aware::CacheAwareModel`]
//! drives the cache-aware streaming export with its opaque cache tensors.
//! They are distinct modes, selected at initialization; neither falls back
//! to the other.

pub mod cache_aware;
pub mod ctc;

pub use cache_aware::CacheAwareModel;
pub use ctc::CtcModel;

use ndarray::{Array3, ArrayView2};
use ort::execution_providers::CPUExecutionProvider;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum ModelError {
    #[error("ORT error: {0}")]
    Ort(#[from] ort::Error),
    #[error("ndarray shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("Model file not found: {0}")]
    ModelNotFound(String),
    #[error("Model input not found: {0}")]
    InputNotFound(String),
    #[error("Model output not found: {0}")]
    OutputNotFound(String),
    #[error("Failed to get tensor shape for: {0}")]
    TensorShape(String),
    #[error("cannot pad {frames} frames into a {pad_to}-frame window")]
    BadPadding { frames: usize, pad_to: usize },
}

/// Acoustic model configuration. I/O names and shapes are probed from the
/// graph at load time, not configured.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub model_path: PathBuf,
    pub num_threads: usize,
    pub num_mel_bins: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            num_threads: 4,
            num_mel_bins: 80,
        }
    }
}

/// Feature tensor laid out for the model, padding separated from content.
///
/// The extractor emits `[time, mel]`; the graph consumes `[batch, mel, time]`.
/// This type is the only place that transpose happens, and it cannot be
/// built without recording how many of the `T` frames are real. The length
/// input fed to the graph must be `valid_len`, never the padded extent:
/// the encoder masks attention from it, and a padded or sentinel value
/// silently degrades accuracy.
pub struct PaddedSignal {
    data: Array3<f32>,
    valid_len: usize,
}

impl PaddedSignal {
    /// Transpose `[time, mel]` features into a `[1, mel, T]` tensor,
    /// zero-padding the trailing frames when `pad_to` exceeds the frame count.
    pub fn from_features(
        features: ArrayView2<f32>,
        pad_to: Option<usize>,
    ) -> Result<Self, ModelError> {
        let frames = features.nrows();
        let mel = features.ncols();
        let t = pad_to.unwrap_or(frames);
        if t < frames {
            return Err(ModelError::BadPadding { frames, pad_to: t });
        }

        let mut data = Array3::zeros((1, mel, t));
        for (ti, row) in features.rows().into_iter().enumerate() {
            for (m, &v) in row.iter().enumerate() {
                data[[0, m, ti]] = v;
            }
        }

        Ok(Self {
            data,
            valid_len: frames,
        })
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    /// Count of real (non-padded) frames.
    pub fn valid_len(&self) -> usize {
        self.valid_len
    }

    pub fn padded_len(&self) -> usize {
        self.data.shape()[2]
    }
}

pub(crate) fn init_session(path: &Path, num_threads: usize) -> Result<Session, ModelError> {
    if !path.exists() {
        return Err(ModelError::ModelNotFound(path.display().to_string()));
    }

    let mut builder = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_execution_providers([CPUExecutionProvider::default().build()])?
        .with_parallel_execution(true)?;

    if num_threads > 0 {
        builder = builder.with_intra_threads(num_threads)?;
    }

    let session = builder.commit_from_file(path)?;

    for input in &session.inputs {
        log::info!(
            "Model input: name={}, type={:?}",
            input.name,
            input.input_type
        );
    }
    for output in &session.outputs {
        log::info!(
            "Model output: name={}, type={:?}",
            output.name,
            output.output_type
        );
    }

    Ok(session)
}
