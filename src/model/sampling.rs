//! Multi-scale deformable sampling primitives
//!
//! Both implementations compute, for each (batch, query, head), the sum over (level, point)
//! of `weight * bilinear(value_level, location)`, with align_corners=False and zero padding
//! outside the level grid. Heads are concatenated into the embedding axis.

use candle_core::{DType, Device, IndexOp, Result, Tensor, D};

use crate::config::SamplerPolicy;

/// Gather + bilinear interpolate + weighted sum over a multi-level flattened value
pub trait MsDeformSampler: Send + Sync {
    /// # Arguments
    /// * `value` - [N, Len_in, n_heads, head_dim]
    /// * `spatial_shapes` - [(H, W), ...] for each level
    /// * `level_start_index` - [0, H0*W0, H0*W0+H1*W1, ...]
    /// * `sampling_locations` - [N, Len_q, n_heads, n_levels, n_points, 2] in [0, 1]
    /// * `attention_weights` - [N, Len_q, n_heads, n_levels, n_points]
    ///
    /// # Returns
    /// Output tensor [N, Len_q, n_heads * head_dim]
    fn sample(
        &self,
        value: &Tensor,
        spatial_shapes: &[(usize, usize)],
        level_start_index: &[usize],
        sampling_locations: &Tensor,
        attention_weights: &Tensor,
    ) -> Result<Tensor>;

    fn name(&self) -> &'static str;
}

/// Pick the sampler for data living on `device`
///
/// The fused sampler always accumulates in f32; a half precision accumulation path is not
/// offered since the many summations it performs are unstable in f16.
pub fn select_sampler(
    policy: SamplerPolicy,
    device: &Device,
    im2col_step: usize,
) -> Box<dyn MsDeformSampler> {
    let fused = match policy {
        SamplerPolicy::Fused => true,
        SamplerPolicy::Portable => false,
        SamplerPolicy::Auto => device.is_cuda() || device.is_metal(),
    };
    if fused {
        Box::new(FusedSampler::new(im2col_step))
    } else {
        Box::new(PortableSampler)
    }
}

// =============================================================================
// Portable sampler
// =============================================================================

/// Per-level bilinear grid sampling, built from plain tensor ops
#[derive(Debug, Clone, Copy, Default)]
pub struct PortableSampler;

impl MsDeformSampler for PortableSampler {
    fn sample(
        &self,
        value: &Tensor,
        spatial_shapes: &[(usize, usize)],
        level_start_index: &[usize],
        sampling_locations: &Tensor,
        attention_weights: &Tensor,
    ) -> Result<Tensor> {
        let (n, _, n_heads, head_dim) = value.dims4()?;
        let dims = sampling_locations.dims();
        let (len_q, n_levels, n_points) = (dims[1], dims[3], dims[4]);

        // [N, n_heads, head_dim, Len_in]
        let value = value.permute((0, 2, 3, 1))?.contiguous()?;

        // grid_sample expects [-1, 1]
        let sampling_grids = ((sampling_locations * 2.0)? - 1.0)?;

        let mut sampling_value_list = Vec::with_capacity(n_levels);
        for (lid, &(h, w)) in spatial_shapes.iter().enumerate() {
            // [N*n_heads, head_dim, H, W]
            let value_l = value
                .narrow(3, level_start_index[lid], h * w)?
                .reshape((n * n_heads, head_dim, h, w))?;

            // [N, Len_q, n_heads, n_points, 2] -> [N*n_heads, Len_q, n_points, 2]
            let grid_l = sampling_grids
                .i((.., .., .., lid, .., ..))?
                .transpose(1, 2)?
                .reshape((n * n_heads, len_q, n_points, 2))?;

            // [N*n_heads, head_dim, Len_q, n_points]
            sampling_value_list.push(grid_sample_bilinear(&value_l, &grid_l)?);
        }

        // [N*n_heads, head_dim, Len_q, n_levels * n_points]
        let sampling_values = Tensor::stack(&sampling_value_list, 3)?.reshape((
            n * n_heads,
            head_dim,
            len_q,
            n_levels * n_points,
        ))?;

        // [N, Len_q, n_heads, n_levels, n_points] -> [N*n_heads, 1, Len_q, n_levels * n_points]
        let attention_weights = attention_weights
            .reshape((n, len_q, n_heads, n_levels * n_points))?
            .transpose(1, 2)?
            .reshape((n * n_heads, 1, len_q, n_levels * n_points))?;

        let output = sampling_values
            .broadcast_mul(&attention_weights)?
            .sum(D::Minus1)?;

        // [N, n_heads * head_dim, Len_q] -> [N, Len_q, n_heads * head_dim]
        output.reshape((n, n_heads * head_dim, len_q))?.transpose(1, 2)
    }

    fn name(&self) -> &'static str {
        "portable"
    }
}

/// Bilinear interpolation (grid_sample) with align_corners=False and zero padding
///
/// # Arguments
/// * `input` - Input tensor [N, C, H, W]
/// * `grid` - Grid tensor [N, H_out, W_out, 2] with (x, y) values in [-1, 1]
///
/// # Returns
/// Sampled tensor [N, C, H_out, W_out]
fn grid_sample_bilinear(input: &Tensor, grid: &Tensor) -> Result<Tensor> {
    let (n, c, h, w) = input.dims4()?;
    let (_, h_out, w_out, _) = grid.dims4()?;
    if h == 0 || w == 0 {
        candle_core::bail!("grid_sample input has an empty {h}x{w} grid");
    }
    let dtype = input.dtype();

    // Pixel centers sit at 0, 1, ..., W-1
    let x = (((grid.i((.., .., .., 0))? + 1.0)? * (w as f64 / 2.0))? - 0.5)?;
    let y = (((grid.i((.., .., .., 1))? + 1.0)? * (h as f64 / 2.0))? - 0.5)?;

    let x0 = x.floor()?;
    let y0 = y.floor()?;
    let input_flat = input.reshape((n, c, h * w))?;

    let mut result: Option<Tensor> = None;
    for (dx, dy) in [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)] {
        let cx = (&x0 + dx)?;
        let cy = (&y0 + dy)?;

        // Weight of this corner: (1 - |x - cx|) * (1 - |y - cy|)
        let wx = ((&x - &cx)?.abs()?.neg()? + 1.0)?;
        let wy = ((&y - &cy)?.abs()?.neg()? + 1.0)?;

        // Out-of-bounds corners contribute nothing
        let valid = cx
            .ge(0.0)?
            .mul(&cx.lt(w as f64)?)?
            .mul(&cy.ge(0.0)?)?
            .mul(&cy.lt(h as f64)?)?
            .to_dtype(dtype)?;
        let weight = wx.mul(&wy)?.to_dtype(dtype)?.mul(&valid)?.unsqueeze(1)?;

        let cx = cx.clamp(0.0, (w - 1) as f64)?;
        let cy = cy.clamp(0.0, (h - 1) as f64)?;
        let idx = ((cy * w as f64)? + cx)?
            .to_dtype(DType::I64)?
            .reshape((n, 1, h_out * w_out))?
            .repeat((1, c, 1))?;

        let corner = input_flat
            .gather(&idx, 2)?
            .reshape((n, c, h_out, w_out))?
            .broadcast_mul(&weight)?;
        result = Some(match result {
            Some(acc) => (acc + corner)?,
            None => corner,
        });
    }

    match result {
        Some(r) => Ok(r),
        None => candle_core::bail!("grid_sample produced no corners"),
    }
}

// =============================================================================
// Fused sampler
// =============================================================================

/// Single gather per bilinear corner across all levels, batch processed in
/// `im2col_step` sized chunks and accumulated in f32
#[derive(Debug, Clone, Copy)]
pub struct FusedSampler {
    im2col_step: usize,
}

impl FusedSampler {
    pub fn new(im2col_step: usize) -> Self {
        Self {
            im2col_step: im2col_step.max(1),
        }
    }

    fn sample_chunk(
        &self,
        value: &Tensor,
        spatial_shapes: &[(usize, usize)],
        level_start_index: &[usize],
        sampling_locations: &Tensor,
        attention_weights: &Tensor,
    ) -> Result<Tensor> {
        let (n, len_in, n_heads, head_dim) = value.dims4()?;
        let dims = sampling_locations.dims();
        let (len_q, n_levels, n_points) = (dims[1], dims[3], dims[4]);
        let nh = n * n_heads;
        let samples = len_q * n_levels * n_points;
        let device = value.device();

        // [N*n_heads, head_dim, Len_in]
        let value = value
            .permute((0, 2, 3, 1))?
            .reshape((nh, head_dim, len_in))?;
        // [N*n_heads, Len_q, n_levels, n_points, 2]
        let locations = sampling_locations
            .permute(vec![0, 2, 1, 3, 4, 5])?
            .reshape((nh, len_q, n_levels, n_points, 2))?;
        // [N*n_heads, 1, Len_q * n_levels * n_points]
        let attention_weights = attention_weights
            .permute(vec![0, 2, 1, 3, 4])?
            .reshape((nh, 1, samples))?;

        // Per-level constants shaped [1, 1, n_levels, 1]
        let per_level = |f: &dyn Fn(usize, (usize, usize)) -> usize| -> Result<Tensor> {
            let data: Vec<f32> = spatial_shapes
                .iter()
                .enumerate()
                .map(|(lid, &hw)| f(lid, hw) as f32)
                .collect();
            Tensor::from_vec(data, (1, 1, n_levels, 1), device)
        };
        let widths = per_level(&|_, (_, w)| w)?;
        let heights = per_level(&|_, (h, _)| h)?;
        let starts = per_level(&|lid, _| level_start_index[lid])?;
        let max_x = (&widths - 1.0)?;
        let max_y = (&heights - 1.0)?;

        let x = (locations.i((.., .., .., .., 0))?.broadcast_mul(&widths)? - 0.5)?;
        let y = (locations.i((.., .., .., .., 1))?.broadcast_mul(&heights)? - 0.5)?;
        let x0 = x.floor()?;
        let y0 = y.floor()?;

        let mut output = Tensor::zeros((nh, head_dim, samples), DType::F32, device)?;
        for (dx, dy) in [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)] {
            let cx = (&x0 + dx)?;
            let cy = (&y0 + dy)?;
            let wx = ((&x - &cx)?.abs()?.neg()? + 1.0)?;
            let wy = ((&y - &cy)?.abs()?.neg()? + 1.0)?;
            let valid = cx
                .ge(0.0)?
                .mul(&cx.broadcast_lt(&widths)?)?
                .mul(&cy.ge(0.0)?)?
                .mul(&cy.broadcast_lt(&heights)?)?
                .to_dtype(DType::F32)?;
            let weight = wx
                .mul(&wy)?
                .mul(&valid)?
                .reshape((nh, 1, samples))?
                .mul(&attention_weights)?;

            // Flat index into the whole multi-level value
            let cx = cx.maximum(0.0)?.broadcast_minimum(&max_x)?;
            let cy = cy.maximum(0.0)?.broadcast_minimum(&max_y)?;
            let idx = cy
                .broadcast_mul(&widths)?
                .add(&cx)?
                .broadcast_add(&starts)?
                .to_dtype(DType::I64)?
                .reshape((nh, 1, samples))?
                .broadcast_as((nh, head_dim, samples))?
                .contiguous()?;

            let corner = value.gather(&idx, 2)?.broadcast_mul(&weight)?;
            output = (output + corner)?;
        }

        // [N*n_heads, head_dim, Len_q] -> [N, Len_q, n_heads * head_dim]
        output
            .reshape((nh, head_dim, len_q, n_levels * n_points))?
            .sum(D::Minus1)?
            .reshape((n, n_heads * head_dim, len_q))?
            .transpose(1, 2)
    }
}

impl MsDeformSampler for FusedSampler {
    fn sample(
        &self,
        value: &Tensor,
        spatial_shapes: &[(usize, usize)],
        level_start_index: &[usize],
        sampling_locations: &Tensor,
        attention_weights: &Tensor,
    ) -> Result<Tensor> {
        let dtype = value.dtype();
        let value = value.to_dtype(DType::F32)?;
        let sampling_locations = sampling_locations.to_dtype(DType::F32)?;
        let attention_weights = attention_weights.to_dtype(DType::F32)?;

        let n = value.dim(0)?;
        let mut chunks = Vec::with_capacity(n.div_ceil(self.im2col_step));
        for start in (0..n).step_by(self.im2col_step) {
            let len = self.im2col_step.min(n - start);
            chunks.push(self.sample_chunk(
                &value.narrow(0, start, len)?,
                spatial_shapes,
                level_start_index,
                &sampling_locations.narrow(0, start, len)?,
                &attention_weights.narrow(0, start, len)?,
            )?);
        }
        Tensor::cat(&chunks, 0)?.to_dtype(dtype)
    }

    fn name(&self) -> &'static str {
        "fused"
    }
}
