#[derive(thiserror::Error, Debug)]
pub enum DetectError {
    #[error("ONNX runtime error: {source}")]
    Ort {
        #[from]
        source: ort::Error,
    },
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("unknown device \"{0}\" (expected \"cpu\" or \"cuda:N\")")]
    BadDevice(String),
    #[error("missing model output \"{0}\"")]
    MissingOutput(String),
    #[error("unexpected model output size {0} (not a whole number of candidates)")]
    BadOutputSize(usize),
    #[error("failed to build image buffer for model input")]
    BadImage,
}

pub type Result<T> = std::result::Result<T, DetectError>;
