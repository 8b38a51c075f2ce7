//! The recognition boundary. The pool and worker loop treat the model as an
//! opaque, blocking, CPU-heavy callable behind this trait; backends live
//! behind cargo features so the dispatch subsystem builds without any
//! inference runtime.

use image::RgbImage;
use thiserror::Error;

use crate::config::PoolConfig;
use crate::protocol::TextLine;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model load failed: {0}")]
    ModelLoad(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("no OCR backend compiled in (enable the `onnx` feature)")]
    BackendUnavailable,
}

/// Per-call parameters forwarded from the request.
#[derive(Debug, Clone)]
pub struct RecognizeOptions {
    /// Run the textline orientation classifier and rotate flipped lines.
    pub use_angle_cls: bool,
    /// Detection-side resize limit.
    pub limit_side_len: u32,
}

/// A loaded recognition model. One instance per worker, used strictly
/// sequentially, so `&mut self` is fine and implementations need no locking.
pub trait OcrEngine: Send {
    fn recognize(
        &mut self,
        image: &RgbImage,
        opts: &RecognizeOptions,
    ) -> Result<Vec<TextLine>, EngineError>;
}

/// Build the configured production backend.
#[cfg(feature = "onnx")]
pub fn build_engine(config: &PoolConfig) -> Result<Box<dyn OcrEngine>, EngineError> {
    let engine = crate::onnx_engine::OnnxOcrEngine::load(config)?;
    Ok(Box::new(engine))
}

#[cfg(not(feature = "onnx"))]
pub fn build_engine(_config: &PoolConfig) -> Result<Box<dyn OcrEngine>, EngineError> {
    Err(EngineError::BackendUnavailable)
}
