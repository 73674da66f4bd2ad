//! Temporal Self-Attention
//!
//! Deformable multi-head attention that fuses the current BEV query with the previous
//! BEV frame. Sampling offsets come from a 3x3 convolution over the query grid rather
//! than a per-query linear layer, so neighbouring BEV cells inform each offset.
//!
//! Pipeline per call:
//! - queue normalization (pad a missing previous frame, fuse it into the query)
//! - offset and attention weight prediction
//! - multi-scale deformable sampling for every queue slot
//! - masked mean over the real slots, output projection, dropout and residual

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{Conv2d, Conv2dConfig, Dropout, Init, Linear, Module, VarBuilder, VarMap};

use super::queue::{normalize_queue, PaddedQueue};
use super::reference::ReferencePoints;
use super::sampling::select_sampler;
use crate::config::{Advisory, TemporalAttentionConfig};
use crate::error::{AttentionError, Result};

/// Inputs of one forward call
///
/// Tensors follow the operator's layout: (num_query, bs, embed_dims) unless
/// `batch_first` is set, in which case (bs, num_query, embed_dims).
#[derive(Debug, Clone, Copy)]
pub struct TemporalAttentionInput<'a> {
    /// Current BEV query
    pub query: &'a Tensor,
    /// Queue slots, oldest first; defaults to `query`
    pub value: Option<&'a Tensor>,
    /// Residual added to the output; defaults to `query` without `query_pos`
    pub identity: Option<&'a Tensor>,
    /// Positional encoding added to `query`
    pub query_pos: Option<&'a Tensor>,
    /// One set per value slot: [_bs, num_query, n_levels, 2 or 4]
    pub reference_points: &'a Tensor,
    /// Spatial shapes [(H, W), ...]
    pub spatial_shapes: &'a [(usize, usize)],
    /// Start index of each level in the flattened value
    pub level_start_index: &'a [usize],
    /// u8 mask [_bs, num_value], non-zero marks padded positions
    pub key_padding_mask: Option<&'a Tensor>,
}

impl<'a> TemporalAttentionInput<'a> {
    pub fn new(
        query: &'a Tensor,
        reference_points: &'a Tensor,
        spatial_shapes: &'a [(usize, usize)],
        level_start_index: &'a [usize],
    ) -> Self {
        Self {
            query,
            value: None,
            identity: None,
            query_pos: None,
            reference_points,
            spatial_shapes,
            level_start_index,
            key_padding_mask: None,
        }
    }

    pub fn with_value(mut self, value: &'a Tensor) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_identity(mut self, identity: &'a Tensor) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_query_pos(mut self, query_pos: &'a Tensor) -> Self {
        self.query_pos = Some(query_pos);
        self
    }

    pub fn with_key_padding_mask(mut self, key_padding_mask: &'a Tensor) -> Self {
        self.key_padding_mask = Some(key_padding_mask);
        self
    }
}

/// Predicted offsets and weights, queue slot axis kept separate
#[derive(Debug)]
pub struct SamplingPlan {
    /// [bs, num_query, n_heads, num_bev_queue, n_levels, n_points, 2]
    pub offsets: Tensor,
    /// Softmax over (level, point): [bs, num_query, n_heads, num_bev_queue, n_levels, n_points]
    pub attention_weights: Tensor,
}

/// Temporal deformable self-attention over a BEV queue
pub struct TemporalSelfAttention {
    config: TemporalAttentionConfig,
    advisories: Vec<Advisory>,

    /// 3x3 convolution predicting sampling offsets
    sampling_offsets: Conv2d,
    /// Linear layer for attention weights
    attention_weights: Linear,
    /// Linear layer for value projection
    value_proj: Linear,
    /// Linear layer for output projection
    output_proj: Linear,
    dropout: Dropout,
}

impl TemporalSelfAttention {
    /// Build the operator from weights
    ///
    /// Init hints only apply when `vb` creates variables (VarMap); file backed builders
    /// load the stored tensors.
    pub fn load(config: TemporalAttentionConfig, vb: VarBuilder) -> Result<Self> {
        let advisories = config.validate()?;
        for advisory in &advisories {
            tracing::warn!(%advisory, "suboptimal temporal attention config");
        }

        let embed_dims = config.embed_dims;
        let fused_dims = embed_dims * config.num_bev_queue;

        let conv_vb = vb.pp("sampling_offsets");
        let conv_weight = conv_vb.get_with_hints(
            (config.offset_channels(), fused_dims, 3, 3),
            "weight",
            Init::Const(0.0),
        )?;
        let conv_bias =
            conv_vb.get_with_hints(config.offset_channels(), "bias", Init::Const(0.0))?;
        let conv_config = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let sampling_offsets = Conv2d::new(conv_weight, Some(conv_bias), conv_config);

        let attention_weights = linear_with_init(
            fused_dims,
            config.weight_channels(),
            Init::Const(0.0),
            vb.pp("attention_weights"),
        )?;
        let value_proj = linear_with_init(
            embed_dims,
            embed_dims,
            xavier_uniform(embed_dims, embed_dims),
            vb.pp("value_proj"),
        )?;
        let output_proj = linear_with_init(
            embed_dims,
            embed_dims,
            xavier_uniform(embed_dims, embed_dims),
            vb.pp("output_proj"),
        )?;
        let dropout = Dropout::new(config.dropout);

        Ok(Self {
            config,
            advisories,
            sampling_offsets,
            attention_weights,
            value_proj,
            output_proj,
            dropout,
        })
    }

    /// Create fresh parameters in `varmap` and apply the initialization policy
    pub fn init(
        config: TemporalAttentionConfig,
        varmap: &mut VarMap,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let grid = sampling_offsets_bias(&config);
        let attn = Self::load(config, VarBuilder::from_varmap(varmap, dtype, device))?;

        let bias = Tensor::from_vec(grid, attn.config.offset_channels(), device)?.to_dtype(dtype)?;
        varmap.set_one("sampling_offsets.bias", bias)?;
        Ok(attn)
    }

    pub fn config(&self) -> &TemporalAttentionConfig {
        &self.config
    }

    /// Non-fatal findings from config validation
    pub fn advisories(&self) -> &[Advisory] {
        &self.advisories
    }

    /// Predict sampling offsets and attention weights
    ///
    /// # Arguments
    /// * `query` - Queue-fused query [bs, num_query, embed_dims * num_bev_queue]
    /// * `grid` - (H, W) of the first level, H * W == num_query
    pub fn predict(&self, query: &Tensor, grid: (usize, usize)) -> Result<SamplingPlan> {
        let (bs, num_query, fused_dims) = query.dims3()?;
        let (h, w) = grid;
        if h * w != num_query {
            return Err(AttentionError::QueryGridMismatch {
                num_query,
                height: h,
                width: w,
            });
        }
        let expected = self.config.embed_dims * self.config.num_bev_queue;
        if fused_dims != expected {
            return Err(AttentionError::EmbedDimMismatch {
                tensor: "queue-fused query",
                expected,
                actual: fused_dims,
            });
        }

        let TemporalAttentionConfig {
            num_heads,
            num_levels,
            num_points,
            num_bev_queue,
            ..
        } = self.config;

        // [bs, num_query, C] -> [bs, C, H, W]
        let spatial = query
            .transpose(1, 2)?
            .contiguous()?
            .reshape((bs, fused_dims, h, w))?;
        // [bs, C_out, H, W] -> [bs, H, W, C_out]
        let offsets = self
            .sampling_offsets
            .forward(&spatial)?
            .permute((0, 2, 3, 1))?
            .reshape(vec![
                bs,
                num_query,
                num_heads,
                num_bev_queue,
                num_levels,
                num_points,
                2,
            ])?;

        let attention_weights = self
            .attention_weights
            .forward(query)?
            .reshape((
                bs,
                num_query,
                num_heads,
                num_bev_queue,
                num_levels * num_points,
            ))?;
        let attention_weights = candle_nn::ops::softmax_last_dim(&attention_weights)?.reshape((
            bs,
            num_query,
            num_heads,
            num_bev_queue,
            num_levels,
            num_points,
        ))?;

        Ok(SamplingPlan {
            offsets,
            attention_weights,
        })
    }

    /// Forward pass
    ///
    /// `train` enables dropout; with `train == false` the call is deterministic.
    ///
    /// # Returns
    /// Output tensor with the same shape and layout as `input.query`
    pub fn forward(&self, input: &TemporalAttentionInput, train: bool) -> Result<Tensor> {
        let TemporalAttentionConfig {
            embed_dims,
            num_heads,
            num_levels,
            num_points,
            num_bev_queue,
            batch_first,
            ..
        } = self.config;

        let identity = input.identity.unwrap_or(input.query);
        let value = input.value.unwrap_or(input.query);
        let query = match input.query_pos {
            Some(pos) => (input.query + pos)?,
            None => input.query.clone(),
        };

        // [bs, num_query, C]
        let (query, value) = if batch_first {
            (query, value.clone())
        } else {
            (query.transpose(0, 1)?, value.transpose(0, 1)?)
        };

        let (bs, num_query, query_dims) = query.dims3()?;
        let (_, num_value, value_dims) = value.dims3()?;
        for (tensor, actual) in [("query", query_dims), ("value", value_dims)] {
            if actual != embed_dims {
                return Err(AttentionError::EmbedDimMismatch {
                    tensor,
                    expected: embed_dims,
                    actual,
                });
            }
        }
        super::check_levels(
            input.spatial_shapes,
            input.level_start_index,
            num_levels,
            num_value,
        )?;
        let grid = input.spatial_shapes[0];
        if grid.0 * grid.1 != num_query {
            return Err(AttentionError::QueryGridMismatch {
                num_query,
                height: grid.0,
                width: grid.1,
            });
        }
        // Resolve the layout and encoding once, before any work is done
        let ref_dims = input.reference_points.dims();
        if ref_dims.len() != 4 || ref_dims[1] != num_query || ref_dims[2] != num_levels {
            return Err(AttentionError::ReferencePointShape {
                num_query,
                num_levels,
                actual: ref_dims.to_vec(),
            });
        }
        let reference_points = ReferencePoints::classify(input.reference_points.clone())?;

        let PaddedQueue {
            query,
            value,
            reference_points,
            key_padding_mask,
            mask,
            lack,
        } = normalize_queue(
            &query,
            &value,
            &reference_points,
            input.key_padding_mask,
            num_bev_queue,
        )?;

        let mut value = self.value_proj.forward(&value)?;
        if let Some(key_padding_mask) = key_padding_mask {
            let keep = key_padding_mask
                .eq(0u8)?
                .to_dtype(value.dtype())?
                .unsqueeze(D::Minus1)?;
            value = value.broadcast_mul(&keep)?;
        }
        let head_dim = embed_dims / num_heads;
        // Every query sample sees the same queue: [num_bev_queue * bs, num_value, n_heads, head_dim]
        let value = value
            .reshape((num_bev_queue, 1, num_value, num_heads, head_dim))?
            .broadcast_as((num_bev_queue, bs, num_value, num_heads, head_dim))?
            .reshape((num_bev_queue * bs, num_value, num_heads, head_dim))?;

        let SamplingPlan {
            offsets,
            attention_weights,
        } = self.predict(&query, grid)?;

        // Queue slot becomes a batch multiplier, index = slot * bs + b
        let attention_weights = attention_weights
            .permute(vec![3, 0, 1, 2, 4, 5])?
            .reshape((
                num_bev_queue * bs,
                num_query,
                num_heads,
                num_levels,
                num_points,
            ))?;
        let offsets = offsets.permute(vec![3, 0, 1, 2, 4, 5, 6])?.reshape((
            num_bev_queue * bs,
            num_query,
            num_heads,
            num_levels,
            num_points,
            2,
        ))?;

        let reference_points = reference_points.map(|t| {
            let (_, _, _, components) = t.dims4()?;
            let shape = (num_bev_queue, bs, num_query, num_levels, components);
            Ok(t.unsqueeze(1)?.broadcast_as(shape)?.reshape((
                num_bev_queue * bs,
                num_query,
                num_levels,
                components,
            ))?)
        })?;
        let sampling_locations =
            reference_points.sampling_locations(&offsets, input.spatial_shapes, num_points)?;

        let sampler = select_sampler(self.config.sampler, value.device(), self.config.im2col_step);
        tracing::debug!(sampler = sampler.name(), bs, lack, "deformable sampling");
        let output = sampler.sample(
            &value,
            input.spatial_shapes,
            input.level_start_index,
            &sampling_locations,
            &attention_weights,
        )?;

        let output = aggregate_queue(&output, &mask, bs, num_bev_queue)?;
        let output = self.output_proj.forward(&output)?;

        let output = if batch_first {
            output
        } else {
            output.transpose(0, 1)?
        };

        Ok((self.dropout.forward(&output, train)? + identity)?)
    }
}

/// Masked mean over queue slots
///
/// # Arguments
/// * `per_slot` - Sampler output [num_bev_queue * bs, num_query, C], slot-major
/// * `mask` - 1 for real slots, 0 for synthesized ones [num_bev_queue]
///
/// # Returns
/// [bs, num_query, C]
pub fn aggregate_queue(
    per_slot: &Tensor,
    mask: &Tensor,
    bs: usize,
    num_bev_queue: usize,
) -> Result<Tensor> {
    let (_, num_query, dims) = per_slot.dims3()?;
    let valid = mask.sum_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
    if valid <= 0.0 {
        return Err(AttentionError::EmptyQueue);
    }
    let weighted = per_slot
        .reshape((num_bev_queue, bs, num_query, dims))?
        .broadcast_mul(&mask.to_dtype(per_slot.dtype())?.reshape((num_bev_queue, 1, 1, 1))?)?
        .sum(0)?;
    Ok((weighted / valid as f64)?)
}

/// Linear layer whose fresh parameters follow `init`, with a zero bias
fn linear_with_init(
    in_dim: usize,
    out_dim: usize,
    init: Init,
    vb: VarBuilder,
) -> candle_core::Result<Linear> {
    let weight = vb.get_with_hints((out_dim, in_dim), "weight", init)?;
    let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Xavier/Glorot uniform bound for a linear layer
fn xavier_uniform(fan_in: usize, fan_out: usize) -> Init {
    let bound = (6.0 / (fan_in + fan_out) as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

/// Initial offset bias: each head points along its own angle, farther for later points
///
/// Layout is [n_heads, num_bev_queue * n_levels, n_points, 2], the channel order of the
/// offset convolution.
fn sampling_offsets_bias(config: &TemporalAttentionConfig) -> Vec<f32> {
    let TemporalAttentionConfig {
        num_heads,
        num_levels,
        num_points,
        num_bev_queue,
        ..
    } = *config;

    let mut grid = Vec::with_capacity(config.offset_channels());
    for head in 0..num_heads {
        let theta = head as f32 * (2.0 * std::f32::consts::PI / num_heads as f32);
        let (x, y) = (theta.cos(), theta.sin());
        let scale = x.abs().max(y.abs());
        let (x, y) = (x / scale, y / scale);
        for _ in 0..num_bev_queue * num_levels {
            for point in 0..num_points {
                let k = (point + 1) as f32;
                grid.push(x * k);
                grid.push(y * k);
            }
        }
    }
    grid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SamplerPolicy;
    use crate::model::level_start_index;
    use crate::model::sampling::{MsDeformSampler, PortableSampler};
    use candle_core::IndexOp;

    /// embed 8, 2 heads, 1 level, 2 points, queue 2, 2x2 grid
    fn small_config() -> TemporalAttentionConfig {
        TemporalAttentionConfig {
            embed_dims: 8,
            num_heads: 2,
            num_levels: 1,
            num_points: 2,
            num_bev_queue: 2,
            ..Default::default()
        }
    }

    fn build(config: TemporalAttentionConfig) -> (TemporalSelfAttention, VarMap) {
        let mut varmap = VarMap::new();
        let attn = TemporalSelfAttention::init(config, &mut varmap, DType::F32, &Device::Cpu)
            .unwrap();
        (attn, varmap)
    }

    /// Deterministic structured pattern
    fn pattern(shape: (usize, usize, usize), offset: f32) -> Tensor {
        let n = shape.0 * shape.1 * shape.2;
        let data: Vec<f32> = (0..n)
            .map(|i| offset + ((i * 13) % 17) as f32 * 0.05 - 0.4)
            .collect();
        Tensor::from_vec(data, shape, &Device::Cpu).unwrap()
    }

    fn reference_points(bs: usize) -> Tensor {
        let pts: Vec<f32> = (0..bs)
            .flat_map(|_| [0.25f32, 0.25, 0.75, 0.25, 0.25, 0.75, 0.75, 0.75])
            .collect();
        Tensor::from_vec(pts, (bs, 4, 1, 2), &Device::Cpu).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    fn assert_weights_normalized(plan: &SamplingPlan) {
        let dims = plan.attention_weights.dims().to_vec();
        let sums = plan
            .attention_weights
            .flatten_from(4)
            .unwrap()
            .sum(D::Minus1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(sums.len(), dims[0] * dims[1] * dims[2] * dims[3]);
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5, "weights sum to {}", s);
        }
    }

    #[test]
    fn indivisible_embed_dims_fail_construction() {
        let config = TemporalAttentionConfig {
            embed_dims: 10,
            num_heads: 4,
            ..small_config()
        };
        let mut varmap = VarMap::new();
        let err = TemporalSelfAttention::init(config, &mut varmap, DType::F32, &Device::Cpu);
        assert!(matches!(
            err,
            Err(AttentionError::IndivisibleEmbedDims { .. })
        ));
    }

    #[test]
    fn odd_head_dim_is_reported_not_fatal() {
        let config = TemporalAttentionConfig {
            embed_dims: 12,
            num_heads: 2,
            ..small_config()
        };
        let (attn, _) = build(config);
        assert_eq!(
            attn.advisories(),
            &[Advisory::HeadDimNotPowerOfTwo { head_dim: 6 }]
        );
        let (attn, _) = build(small_config());
        assert!(attn.advisories().is_empty());
    }

    #[test]
    fn offset_bias_fans_out_per_head() {
        let config = TemporalAttentionConfig {
            num_heads: 4,
            ..small_config()
        };
        let grid = sampling_offsets_bias(&config);
        assert_eq!(grid.len(), config.offset_channels());

        // Each head block: queue * levels * points * 2 values
        let block = config.num_bev_queue * config.num_levels * config.num_points * 2;
        let head = |h: usize| &grid[h * block..h * block + 4];
        // Head 0 points along +x, head 1 along +y, head 2 along -x; point 1 doubles
        let expected = [[1.0, 0.0, 2.0, 0.0], [0.0, 1.0, 0.0, 2.0], [-1.0, 0.0, -2.0, 0.0]];
        for (h, exp) in expected.iter().enumerate() {
            for (got, want) in head(h).iter().zip(exp) {
                assert!((got - want).abs() < 1e-6, "head {}: {:?}", h, head(h));
            }
        }
    }

    #[test]
    fn init_writes_offset_bias_and_zero_weights() {
        let (_, varmap) = build(small_config());
        let data = varmap.data().lock().unwrap();
        let bias = data["sampling_offsets.bias"]
            .as_tensor()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(bias, sampling_offsets_bias(&small_config()));

        let w = data["attention_weights.weight"].as_tensor();
        assert_eq!(w.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);

        let bound = (6.0f32 / 16.0).sqrt();
        let v = data["value_proj.weight"].as_tensor();
        let max = v.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(max <= bound && max > 0.0);
    }

    #[test]
    fn predicted_weights_sum_to_one() {
        let (attn, varmap) = build(small_config());
        // Non-trivial logits
        let data = varmap.data().lock().unwrap();
        let w = data["attention_weights.weight"].clone();
        drop(data);
        let logits: Vec<f32> = (0..w.elem_count()).map(|i| (i % 7) as f32 * 0.3 - 1.0).collect();
        w.set(&Tensor::from_vec(logits, w.dims().to_vec(), &Device::Cpu).unwrap())
            .unwrap();

        let query = pattern((2, 4, 16), 0.0);
        let plan = attn.predict(&query, (2, 2)).unwrap();
        assert_eq!(plan.offsets.dims(), &[2, 4, 2, 2, 1, 2, 2]);
        assert_eq!(plan.attention_weights.dims(), &[2, 4, 2, 2, 1, 2]);
        assert_weights_normalized(&plan);
    }

    #[test]
    fn predict_rejects_grid_mismatch() {
        let (attn, _) = build(small_config());
        let query = pattern((1, 4, 16), 0.0);
        assert!(matches!(
            attn.predict(&query, (3, 2)),
            Err(AttentionError::QueryGridMismatch { num_query: 4, .. })
        ));
    }

    #[test]
    fn offsets_start_at_bias() {
        // Zero conv weight: every position predicts the bias grid
        let (attn, _) = build(small_config());
        let query = pattern((1, 4, 16), 0.0);
        let plan = attn.predict(&query, (2, 2)).unwrap();
        let first: Vec<f32> = plan
            .offsets
            .i((0, 3))
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(first, sampling_offsets_bias(&small_config()));
    }

    #[test]
    fn full_queue_output_matches_query_shape() {
        let (attn, _) = build(small_config());
        let shapes = [(2, 2)];
        let start = level_start_index(&shapes);
        // (num_query, bs, embed), two real queue slots
        let query = pattern((4, 2, 8), 0.0);
        let value = pattern((4, 2, 8), 0.3);
        let refs = reference_points(2);

        let input = TemporalAttentionInput::new(&query, &refs, &shapes, &start).with_value(&value);
        let output = attn.forward(&input, false).unwrap();
        assert_eq!(output.dims(), &[4, 2, 8]);

        let fused = Tensor::cat(
            &[
                &value
                    .transpose(0, 1)
                    .unwrap()
                    .narrow(0, 0, 1)
                    .unwrap()
                    .broadcast_as((2, 4, 8))
                    .unwrap()
                    .contiguous()
                    .unwrap(),
                &query.transpose(0, 1).unwrap().contiguous().unwrap(),
            ],
            D::Minus1,
        )
        .unwrap();
        assert_weights_normalized(&attn.predict(&fused, (2, 2)).unwrap());
    }

    #[test]
    fn single_frame_is_padded_and_not_diluted() {
        let (attn, varmap) = build(TemporalAttentionConfig {
            batch_first: true,
            ..small_config()
        });
        // Non-uniform weights so the two queue slots are weighted differently
        let data = varmap.data().lock().unwrap();
        let w = data["attention_weights.weight"].clone();
        drop(data);
        let logits: Vec<f32> = (0..w.elem_count()).map(|i| (i % 5) as f32 * 0.2 - 0.4).collect();
        w.set(&Tensor::from_vec(logits, w.dims().to_vec(), &Device::Cpu).unwrap())
            .unwrap();

        let shapes = [(2, 2)];
        let start = level_start_index(&shapes);
        let query = pattern((1, 4, 8), 0.0);
        let refs = reference_points(1);

        let input = TemporalAttentionInput::new(&query, &refs, &shapes, &start);
        let output = attn.forward(&input, false).unwrap();
        assert_eq!(output.dims(), &[1, 4, 8]);

        // The missing previous frame is the current one
        let fused = Tensor::cat(&[&query, &query], D::Minus1).unwrap();
        let plan = attn.predict(&fused, (2, 2)).unwrap();
        let sample_slot = |slot: usize, value: &Tensor, refs: &Tensor| {
            let value = attn
                .value_proj
                .forward(value)
                .unwrap()
                .reshape((1, 4, 2, 4))
                .unwrap();
            let offsets = plan.offsets.i((.., .., .., slot)).unwrap().contiguous().unwrap();
            let weights = plan
                .attention_weights
                .i((.., .., .., slot))
                .unwrap()
                .contiguous()
                .unwrap();
            let locations = ReferencePoints::classify(refs.clone())
                .unwrap()
                .sampling_locations(&offsets, &shapes, 2)
                .unwrap();
            PortableSampler
                .sample(&value, &shapes, &start, &locations, &weights)
                .unwrap()
        };
        let real = sample_slot(1, &query, &refs);
        let expected = (attn.output_proj.forward(&real).unwrap() + &query).unwrap();
        assert!(
            max_abs_diff(&output, &expected) < 1e-5,
            "diff {}",
            max_abs_diff(&output, &expected)
        );

        // Averaging in the zero placeholder slot would halve the attended value
        let zeros = Tensor::zeros((1, 4, 8), DType::F32, &Device::Cpu).unwrap();
        let zero_refs = Tensor::zeros((1, 4, 1, 2), DType::F32, &Device::Cpu).unwrap();
        let placeholder = sample_slot(0, &zeros, &zero_refs);
        let both = Tensor::cat(&[&placeholder, &real], 0).unwrap();
        let ones = Tensor::ones(2, DType::F32, &Device::Cpu).unwrap();
        let diluted = aggregate_queue(&both, &ones, 1, 2).unwrap();
        let diluted = (attn.output_proj.forward(&diluted).unwrap() + &query).unwrap();
        assert!(max_abs_diff(&output, &diluted) > 1e-4);
    }

    #[test]
    fn dropout_is_active_in_training() {
        let (attn, _) = build(TemporalAttentionConfig {
            dropout: 0.5,
            ..small_config()
        });
        let shapes = [(2, 2)];
        let start = level_start_index(&shapes);
        let query = pattern((4, 1, 8), 0.0);
        let value = pattern((4, 2, 8), 0.2);
        let refs = reference_points(2);
        let zeros = Tensor::zeros((4, 1, 8), DType::F32, &Device::Cpu).unwrap();
        let input = TemporalAttentionInput::new(&query, &refs, &shapes, &start)
            .with_value(&value)
            .with_identity(&zeros);

        let eval = attn.forward(&input, false).unwrap();
        let train = attn.forward(&input, true).unwrap();
        assert_eq!(train.dims(), eval.dims());
        assert!(max_abs_diff(&eval, &train) > 0.0);

        // Surviving entries are rescaled by 1 / (1 - p), dropped ones are zero
        let eval: Vec<f32> = eval.flatten_all().unwrap().to_vec1().unwrap();
        let train: Vec<f32> = train.flatten_all().unwrap().to_vec1().unwrap();
        for (e, t) in eval.iter().zip(&train) {
            assert!(*t == 0.0 || (t - 2.0 * e).abs() < 1e-5, "{} vs {}", t, e);
        }
    }

    #[test]
    fn masked_mean_collapses_to_the_real_slot() {
        let per_slot = Tensor::cat(&[pattern((1, 4, 8), 5.0), pattern((1, 4, 8), -1.0)], 0)
            .unwrap();
        let mask = Tensor::from_vec(vec![0.0f32, 1.0], 2, &Device::Cpu).unwrap();
        let out = aggregate_queue(&per_slot, &mask, 1, 2).unwrap();
        assert_eq!(out.dims(), &[1, 4, 8]);
        assert_eq!(max_abs_diff(&out, &per_slot.narrow(0, 1, 1).unwrap()), 0.0);

        let mask = Tensor::from_vec(vec![1.0f32, 1.0], 2, &Device::Cpu).unwrap();
        let out = aggregate_queue(&per_slot, &mask, 1, 2).unwrap();
        let mean = (per_slot.sum_keepdim(0).unwrap() / 2.0).unwrap();
        assert!(max_abs_diff(&out, &mean) < 1e-6);
    }

    #[test]
    fn all_padded_mask_is_guarded() {
        let per_slot = pattern((2, 4, 8), 0.0);
        let mask = Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            aggregate_queue(&per_slot, &mask, 1, 2),
            Err(AttentionError::EmptyQueue)
        ));
    }

    #[test]
    fn forward_is_deterministic_without_training() {
        let (attn, _) = build(TemporalAttentionConfig {
            dropout: 0.5,
            ..small_config()
        });
        let shapes = [(2, 2)];
        let start = level_start_index(&shapes);
        let query = pattern((4, 1, 8), 0.0);
        let value = pattern((4, 2, 8), 0.2);
        let refs = reference_points(2);
        let input = TemporalAttentionInput::new(&query, &refs, &shapes, &start).with_value(&value);

        let a = attn.forward(&input, false).unwrap();
        let b = attn.forward(&input, false).unwrap();
        let a: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = b.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn identity_and_query_pos() {
        let (attn, _) = build(small_config());
        let shapes = [(2, 2)];
        let start = level_start_index(&shapes);
        let query = pattern((4, 1, 8), 0.0);
        let refs = reference_points(1);
        let zeros = Tensor::zeros((4, 1, 8), DType::F32, &Device::Cpu).unwrap();

        let plain = TemporalAttentionInput::new(&query, &refs, &shapes, &start);
        let base = attn.forward(&plain, false).unwrap();

        // Zero identity removes the residual
        let no_residual = attn.forward(&plain.with_identity(&zeros), false).unwrap();
        let residual = (&base - &no_residual).unwrap();
        assert!(max_abs_diff(&residual, &query) < 1e-6);

        // Zero positional encoding changes nothing
        let with_pos = attn.forward(&plain.with_query_pos(&zeros), false).unwrap();
        assert_eq!(max_abs_diff(&base, &with_pos), 0.0);
    }

    #[test]
    fn fully_masked_value_leaves_only_bias() {
        let (attn, _) = build(TemporalAttentionConfig {
            sampler: SamplerPolicy::Fused,
            ..small_config()
        });
        let shapes = [(2, 2)];
        let start = level_start_index(&shapes);
        let query = pattern((4, 1, 8), 0.0);
        let refs = reference_points(1);
        let zeros = Tensor::zeros((4, 1, 8), DType::F32, &Device::Cpu).unwrap();
        let kpm = Tensor::ones((1, 4), DType::U8, &Device::Cpu).unwrap();

        let input = TemporalAttentionInput::new(&query, &refs, &shapes, &start)
            .with_identity(&zeros)
            .with_key_padding_mask(&kpm);
        // Masked value rows are zero and all biases are zero, so the output is zero
        let output = attn.forward(&input, false).unwrap();
        let max = output.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert_eq!(max, 0.0);
    }

    #[test]
    fn samplers_agree_end_to_end() {
        let shapes = [(2, 2)];
        let start = level_start_index(&shapes);
        let query = pattern((4, 2, 8), 0.0);
        let value = pattern((4, 2, 8), 0.1);
        let refs = reference_points(2);
        let input = TemporalAttentionInput::new(&query, &refs, &shapes, &start).with_value(&value);

        let (portable, varmap) = build(TemporalAttentionConfig {
            sampler: SamplerPolicy::Portable,
            ..small_config()
        });
        // Same weights, fused sampler
        let fused = TemporalSelfAttention::load(
            TemporalAttentionConfig {
                sampler: SamplerPolicy::Fused,
                ..small_config()
            },
            VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu),
        )
        .unwrap();

        let a = portable.forward(&input, false).unwrap();
        let b = fused.forward(&input, false).unwrap();
        assert!(max_abs_diff(&a, &b) < 1e-5);
    }

    #[test]
    fn forward_shape_errors() {
        let (attn, _) = build(small_config());
        let start = [0usize];
        let query = pattern((4, 1, 8), 0.0);

        // Spatial shapes cover 6 positions, value has 4
        let refs = reference_points(1);
        let input = TemporalAttentionInput::new(&query, &refs, &[(2, 3)], &start);
        assert!(matches!(
            attn.forward(&input, false),
            Err(AttentionError::SpatialShapeMismatch {
                expected: 6,
                actual: 4
            })
        ));

        // Three component reference points
        let bad_refs = Tensor::zeros((1, 4, 1, 3), DType::F32, &Device::Cpu).unwrap();
        let input = TemporalAttentionInput::new(&query, &bad_refs, &[(2, 2)], &start);
        assert!(matches!(
            attn.forward(&input, false),
            Err(AttentionError::ReferencePointDim(3))
        ));

        // Three value slots for a queue of two
        let value = pattern((4, 3, 8), 0.0);
        let refs = Tensor::zeros((3, 4, 1, 2), DType::F32, &Device::Cpu).unwrap();
        let input =
            TemporalAttentionInput::new(&query, &refs, &[(2, 2)], &start).with_value(&value);
        assert!(matches!(
            attn.forward(&input, false),
            Err(AttentionError::QueueOverflow { batch: 3, queue: 2 })
        ));
    }

    #[test]
    fn reference_point_layout_is_checked_up_front() {
        let (attn, _) = build(small_config());
        let start = [0usize];
        let query = pattern((4, 1, 8), 0.0);

        // Rank two points: only the last dim looks valid
        let flat = Tensor::zeros((1, 2), DType::F32, &Device::Cpu).unwrap();
        let input = TemporalAttentionInput::new(&query, &flat, &[(2, 2)], &start);
        match attn.forward(&input, false) {
            Err(AttentionError::ReferencePointShape {
                num_query,
                num_levels,
                actual,
            }) => {
                assert_eq!((num_query, num_levels), (4, 1));
                assert_eq!(actual, vec![1, 2]);
            }
            other => panic!("expected ReferencePointShape, got {:?}", other),
        }

        // Wrong number of levels
        let two_levels = Tensor::zeros((1, 4, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let input = TemporalAttentionInput::new(&query, &two_levels, &[(2, 2)], &start);
        assert!(matches!(
            attn.forward(&input, false),
            Err(AttentionError::ReferencePointShape { .. })
        ));

        // Wrong number of queries
        let short = Tensor::zeros((1, 3, 1, 2), DType::F32, &Device::Cpu).unwrap();
        let input = TemporalAttentionInput::new(&query, &short, &[(2, 2)], &start);
        assert!(matches!(
            attn.forward(&input, false),
            Err(AttentionError::ReferencePointShape { .. })
        ));
    }

    #[test]
    fn empty_level_is_rejected() {
        let (attn, _) = build(TemporalAttentionConfig {
            num_levels: 2,
            sampler: SamplerPolicy::Portable,
            ..small_config()
        });
        let shapes = [(2, 2), (0, 3)];
        let start = level_start_index(&shapes);
        let query = pattern((4, 1, 8), 0.0);
        let refs = Tensor::full(0.5f32, (1, 4, 2, 2), &Device::Cpu).unwrap();
        let input = TemporalAttentionInput::new(&query, &refs, &shapes, &start);
        assert!(matches!(
            attn.forward(&input, false),
            Err(AttentionError::EmptyLevel {
                level: 1,
                height: 0,
                width: 3
            })
        ));
    }

    #[test]
    fn box_reference_points_run() {
        let (attn, _) = build(small_config());
        let shapes = [(2, 2)];
        let start = level_start_index(&shapes);
        let query = pattern((4, 1, 8), 0.0);
        let refs = Tensor::full(0.5f32, (1, 4, 1, 4), &Device::Cpu).unwrap();
        let input = TemporalAttentionInput::new(&query, &refs, &shapes, &start);
        assert_eq!(attn.forward(&input, false).unwrap().dims(), &[4, 1, 8]);
    }
}
