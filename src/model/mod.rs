pub mod queue;
pub mod reference;
pub mod sampling;
pub mod temporal_attn;

use crate::error::{AttentionError, Result};

/// Start offsets of each level in the flattened value: [0, h0*w0, h0*w0+h1*w1, ...]
pub fn level_start_index(spatial_shapes: &[(usize, usize)]) -> Vec<usize> {
    spatial_shapes
        .iter()
        .scan(0usize, |start, &(h, w)| {
            let current = *start;
            *start += h * w;
            Some(current)
        })
        .collect()
}

/// Verify that the level layout describes a flattened value of `num_value` positions
pub(crate) fn check_levels(
    spatial_shapes: &[(usize, usize)],
    level_start_index: &[usize],
    num_levels: usize,
    num_value: usize,
) -> Result<()> {
    if spatial_shapes.len() != num_levels {
        return Err(AttentionError::LevelCountMismatch {
            expected: num_levels,
            actual: spatial_shapes.len(),
        });
    }

    if let Some((level, &(height, width))) = spatial_shapes
        .iter()
        .enumerate()
        .find(|&(_, &(h, w))| h == 0 || w == 0)
    {
        return Err(AttentionError::EmptyLevel {
            level,
            height,
            width,
        });
    }

    let total_hw: usize = spatial_shapes.iter().map(|(h, w)| h * w).sum();
    if total_hw != num_value {
        return Err(AttentionError::SpatialShapeMismatch {
            expected: total_hw,
            actual: num_value,
        });
    }

    let expected = self::level_start_index(spatial_shapes);
    if expected != level_start_index {
        return Err(AttentionError::LevelStartIndexMismatch {
            expected,
            actual: level_start_index.to_vec(),
        });
    }
    Ok(())
}
