//! Temporal Self-Attention Configuration
//!
//! Construction-time settings of the operator, their presets and validation.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AttentionError, Result};

/// Which multi-scale deformable sampling implementation to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplerPolicy {
    /// Fused sampler on CUDA/Metal, portable sampler elsewhere
    #[default]
    Auto,
    /// Always use the per-level grid-sample implementation
    Portable,
    /// Always use the single-gather f32 implementation
    Fused,
}

/// Non-fatal findings of config validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advisory {
    /// Per-head width is not a power of two, which slows the fused kernel down
    HeadDimNotPowerOfTwo { head_dim: usize },
}

impl std::fmt::Display for Advisory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Advisory::HeadDimNotPowerOfTwo { head_dim } => write!(
                f,
                "head dimension {head_dim} is not a power of 2, \
                 set embed_dims so that every attention head is a power of 2 wide"
            ),
        }
    }
}

/// Configuration for the temporal deformable self-attention operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemporalAttentionConfig {
    /// Embedding width of query and value
    pub embed_dims: usize,
    /// Number of attention heads
    pub num_heads: usize,
    /// Number of feature levels
    pub num_levels: usize,
    /// Number of sampling points per head per level
    pub num_points: usize,
    /// Length of the BEV queue (previous + current frame)
    pub num_bev_queue: usize,
    /// Batch chunk size of the fused sampler
    pub im2col_step: usize,
    /// Dropout probability on the projected output
    pub dropout: f32,
    /// Whether tensors are (batch, seq, embed) rather than (seq, batch, embed)
    pub batch_first: bool,
    /// Normalization layer config, kept for config compatibility only
    pub norm_cfg: Option<serde_json::Value>,
    /// Sampler selection
    pub sampler: SamplerPolicy,
}

impl Default for TemporalAttentionConfig {
    fn default() -> Self {
        Self {
            embed_dims: 256,
            num_heads: 8,
            num_levels: 4,
            num_points: 4,
            num_bev_queue: 2,
            im2col_step: 64,
            dropout: 0.1,
            batch_first: false,
            norm_cfg: None,
            sampler: SamplerPolicy::Auto,
        }
    }
}

impl TemporalAttentionConfig {
    /// BEVFormer base encoder settings: one BEV level, 4 points
    pub fn bevformer_base() -> Self {
        Self {
            num_levels: 1,
            ..Self::default()
        }
    }

    /// BEVFormer tiny encoder settings
    pub fn bevformer_tiny() -> Self {
        Self {
            embed_dims: 256,
            num_heads: 8,
            num_levels: 1,
            num_points: 4,
            ..Self::default()
        }
    }

    /// Load a config from a JSON file; absent fields take their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn head_dim(&self) -> usize {
        self.embed_dims / self.num_heads
    }

    /// Output channels of the offset convolution
    pub fn offset_channels(&self) -> usize {
        self.num_bev_queue * self.num_heads * self.num_levels * self.num_points * 2
    }

    /// Output features of the attention weight projection
    pub fn weight_channels(&self) -> usize {
        self.num_bev_queue * self.num_heads * self.num_levels * self.num_points
    }

    /// Check the config, returning advisories for suboptimal but valid settings
    pub fn validate(&self) -> Result<Vec<Advisory>> {
        for (field, value) in [
            ("embed_dims", self.embed_dims),
            ("num_heads", self.num_heads),
            ("num_levels", self.num_levels),
            ("num_points", self.num_points),
            ("num_bev_queue", self.num_bev_queue),
            ("im2col_step", self.im2col_step),
        ] {
            if value == 0 {
                return Err(AttentionError::ZeroSized { field });
            }
        }
        if self.embed_dims % self.num_heads != 0 {
            return Err(AttentionError::IndivisibleEmbedDims {
                embed_dims: self.embed_dims,
                num_heads: self.num_heads,
            });
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(AttentionError::InvalidDropout(self.dropout));
        }

        let mut advisories = Vec::new();
        let head_dim = self.head_dim();
        if !head_dim.is_power_of_two() {
            advisories.push(Advisory::HeadDimNotPowerOfTwo { head_dim });
        }
        Ok(advisories)
    }
}
