//! Reference point encodings and the offset-to-location transform

use candle_core::{Tensor, D};

use crate::error::{AttentionError, Result};

/// Reference points, classified once by their trailing dimension
#[derive(Debug, Clone)]
pub enum ReferencePoints {
    /// Normalized (x, y) anchors: [N, Len_q, n_levels, 2]
    TwoComponent(Tensor),
    /// Reference boxes (cx, cy, w, h): [N, Len_q, n_levels, 4]
    FourComponent(Tensor),
}

impl ReferencePoints {
    pub fn classify(reference_points: Tensor) -> Result<Self> {
        match reference_points.dim(D::Minus1)? {
            2 => Ok(Self::TwoComponent(reference_points)),
            4 => Ok(Self::FourComponent(reference_points)),
            other => Err(AttentionError::ReferencePointDim(other)),
        }
    }

    pub fn tensor(&self) -> &Tensor {
        match self {
            Self::TwoComponent(t) | Self::FourComponent(t) => t,
        }
    }

    /// Re-layout the points (padding, slot expansion) under the same encoding
    pub fn map<F>(&self, f: F) -> Result<Self>
    where
        F: FnOnce(&Tensor) -> Result<Tensor>,
    {
        Ok(match self {
            Self::TwoComponent(t) => Self::TwoComponent(f(t)?),
            Self::FourComponent(t) => Self::FourComponent(f(t)?),
        })
    }

    /// Absolute sampling locations from offsets
    ///
    /// # Arguments
    /// * `sampling_offsets` - [N, Len_q, n_heads, n_levels, n_points, 2]
    /// * `spatial_shapes` - [(H, W), ...]
    /// * `n_points` - Sampling points per head per level
    ///
    /// # Returns
    /// Sampling locations [N, Len_q, n_heads, n_levels, n_points, 2]
    pub fn sampling_locations(
        &self,
        sampling_offsets: &Tensor,
        spatial_shapes: &[(usize, usize)],
        n_points: usize,
    ) -> Result<Tensor> {
        let locations = match self {
            Self::TwoComponent(reference_points) => {
                // Offsets are in pixels of each level, normalizer is (W, H)
                let offset_normalizers: Vec<f32> = spatial_shapes
                    .iter()
                    .flat_map(|&(h, w)| [w as f32, h as f32])
                    .collect();
                let offset_normalizer = Tensor::from_vec(
                    offset_normalizers,
                    (1, 1, 1, spatial_shapes.len(), 1, 2),
                    sampling_offsets.device(),
                )?
                .to_dtype(sampling_offsets.dtype())?;

                // [N, Len_q, 1, n_levels, 1, 2]
                let ref_pts = reference_points.unsqueeze(2)?.unsqueeze(4)?;
                let normalized_offsets = sampling_offsets.broadcast_div(&offset_normalizer)?;
                ref_pts.broadcast_add(&normalized_offsets)?
            }
            Self::FourComponent(reference_points) => {
                let ref_xy = reference_points.narrow(D::Minus1, 0, 2)?;
                let ref_wh = reference_points.narrow(D::Minus1, 2, 2)?;
                let ref_xy = ref_xy.unsqueeze(2)?.unsqueeze(4)?;
                let ref_wh = ref_wh.unsqueeze(2)?.unsqueeze(4)?;

                let scale = 0.5 / (n_points as f64);
                let offset_scaled = (sampling_offsets * scale)?.broadcast_mul(&ref_wh)?;
                ref_xy.broadcast_add(&offset_scaled)?
            }
        };
        Ok(locations)
    }
}
