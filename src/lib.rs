//! Temporal deformable self-attention for BEV perception, in pure Rust/Candle
//!
//! Fuses the current bird's-eye-view query with the previous BEV frame through
//! multi-scale deformable attention. When no previous frame exists the queue is padded
//! with a placeholder and the padded slot is masked out of the result.

pub mod config;
pub mod debug;
pub mod error;
pub mod model;

pub use config::{Advisory, SamplerPolicy, TemporalAttentionConfig};
pub use error::{AttentionError, Result};
pub use model::level_start_index;
pub use model::queue::{normalize_queue, PaddedQueue};
pub use model::reference::ReferencePoints;
pub use model::sampling::{select_sampler, FusedSampler, MsDeformSampler, PortableSampler};
pub use model::temporal_attn::{
    aggregate_queue, SamplingPlan, TemporalAttentionInput, TemporalSelfAttention,
};
