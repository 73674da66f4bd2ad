use thiserror::Error;

/// Errors raised while building or running the temporal attention operator.
#[derive(Error, Debug)]
pub enum AttentionError {
    #[error("embed_dims must be divisible by num_heads, but got {embed_dims} and {num_heads}")]
    IndivisibleEmbedDims { embed_dims: usize, num_heads: usize },

    #[error("config field `{field}` must be non-zero")]
    ZeroSized { field: &'static str },

    #[error("dropout probability must be in [0, 1), got {0}")]
    InvalidDropout(f32),

    #[error("expected embedding width {expected} for {tensor}, got {actual}")]
    EmbedDimMismatch {
        tensor: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("spatial shapes cover {expected} positions but value has {actual}")]
    SpatialShapeMismatch { expected: usize, actual: usize },

    #[error("expected {expected} feature levels, got {actual}")]
    LevelCountMismatch { expected: usize, actual: usize },

    #[error("level start index {actual:?} does not match spatial shapes, expected {expected:?}")]
    LevelStartIndexMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("level {level} has an empty {height}x{width} grid")]
    EmptyLevel {
        level: usize,
        height: usize,
        width: usize,
    },

    #[error("last dim of reference_points must be 2 or 4, but got {0}")]
    ReferencePointDim(usize),

    #[error(
        "reference_points must be [batch, {num_query}, {num_levels}, 2|4], but got {actual:?}"
    )]
    ReferencePointShape {
        num_query: usize,
        num_levels: usize,
        actual: Vec<usize>,
    },

    #[error("reference points carry {actual} queue slots but value carries {expected}")]
    ReferenceBatchMismatch { expected: usize, actual: usize },

    #[error("value batch {batch} exceeds the configured queue length {queue}")]
    QueueOverflow { batch: usize, queue: usize },

    #[error("value batch is empty, at least one queue slot is required")]
    EmptyQueue,

    #[error("num_query {num_query} does not match the first level grid {height}x{width}")]
    QueryGridMismatch {
        num_query: usize,
        height: usize,
        width: usize,
    },

    #[error("value length {num_value} must equal num_query {num_query} to fuse queue slots")]
    QueueLengthMismatch { num_value: usize, num_query: usize },

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, AttentionError>;
