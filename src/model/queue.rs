//! BEV queue normalization
//!
//! Aligns the temporal slots carried by the value tensor to the configured queue length,
//! synthesizing a placeholder previous frame when it is missing.

use candle_core::{DType, Tensor, D};

use super::reference::ReferencePoints;
use crate::error::{AttentionError, Result};

/// Query, value and reference points aligned to the full queue
#[derive(Debug)]
pub struct PaddedQueue {
    /// Current query fused with previous frames: [bs, num_query, embed_dims * num_bev_queue]
    pub query: Tensor,
    /// Value with zero slots in front: [num_bev_queue, num_value, embed_dims]
    pub value: Tensor,
    /// Reference points with zero slots in front: [num_bev_queue, num_query, n_levels, 2 or 4]
    pub reference_points: ReferencePoints,
    /// Key padding mask with unmasked slots in front: [num_bev_queue, num_value]
    pub key_padding_mask: Option<Tensor>,
    /// 0 for synthesized slots, 1 for real ones: [num_bev_queue]
    pub mask: Tensor,
    /// Number of synthesized slots
    pub lack: usize,
}

/// Pad the value queue up to `num_bev_queue` slots and fuse previous frames into the query
///
/// # Arguments
/// * `query` - Current query [bs, num_query, C]
/// * `value` - Queue slots ordered oldest first [_bs, num_value, C]
/// * `reference_points` - One set per value slot [_bs, num_query, n_levels, 2 or 4]
/// * `key_padding_mask` - Optional u8 mask [_bs, num_value], non-zero marks padding
pub fn normalize_queue(
    query: &Tensor,
    value: &Tensor,
    reference_points: &ReferencePoints,
    key_padding_mask: Option<&Tensor>,
    num_bev_queue: usize,
) -> Result<PaddedQueue> {
    let (bs, num_query, embed_dims) = query.dims3()?;
    let (value_bs, num_value, _) = value.dims3()?;

    if value_bs == 0 {
        return Err(AttentionError::EmptyQueue);
    }
    if value_bs > num_bev_queue {
        return Err(AttentionError::QueueOverflow {
            batch: value_bs,
            queue: num_bev_queue,
        });
    }
    let ref_bs = reference_points.tensor().dim(0)?;
    if ref_bs != value_bs {
        return Err(AttentionError::ReferenceBatchMismatch {
            expected: value_bs,
            actual: ref_bs,
        });
    }

    let lack = num_bev_queue - value_bs;

    // Prefix: `lack` copies of the oldest slot, then every slot but the current one
    let query = if num_bev_queue > 1 {
        if num_value != num_query {
            return Err(AttentionError::QueueLengthMismatch {
                num_value,
                num_query,
            });
        }
        let mut parts = Vec::with_capacity(num_bev_queue);
        for slot in std::iter::repeat(0).take(lack).chain(0..value_bs - 1) {
            let previous = value
                .narrow(0, slot, 1)?
                .broadcast_as((bs, num_query, embed_dims))?
                .contiguous()?;
            parts.push(previous);
        }
        parts.push(query.clone());
        Tensor::cat(&parts, D::Minus1)?
    } else {
        query.clone()
    };

    let value = pad_front(value, lack)?;
    let reference_points = reference_points.map(|t| Ok(pad_front(t, lack)?))?;
    let key_padding_mask = match key_padding_mask {
        Some(m) => Some(pad_front(&m.to_dtype(DType::U8)?, lack)?),
        None => None,
    };

    let mask: Vec<f32> = (0..num_bev_queue)
        .map(|slot| if slot < lack { 0.0 } else { 1.0 })
        .collect();
    let mask = Tensor::from_vec(mask, num_bev_queue, value.device())?.to_dtype(value.dtype())?;

    tracing::debug!(lack, value_bs, num_bev_queue, "normalized bev queue");

    Ok(PaddedQueue {
        query,
        value,
        reference_points,
        key_padding_mask,
        mask,
        lack,
    })
}

/// Prepend `lack` all-zero slices along dim 0
fn pad_front(t: &Tensor, lack: usize) -> candle_core::Result<Tensor> {
    if lack == 0 {
        return Ok(t.clone());
    }
    let mut shape = t.dims().to_vec();
    shape[0] = lack;
    let zeros = Tensor::zeros(shape, t.dtype(), t.device())?;
    Tensor::cat(&[&zeros, t], 0)
}
