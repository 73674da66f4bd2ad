use candle_core::{DType, Result, Tensor};

/// Tensor statistics for debugging and validation
#[derive(Debug)]
pub struct TensorStats {
    pub shape: Vec<usize>,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub std: f32,
}

impl TensorStats {
    /// Compute statistics for a tensor
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let data: Vec<f32> = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;
        if data.is_empty() {
            candle_core::bail!("cannot compute statistics of an empty tensor {:?}", shape);
        }

        let min = data.iter().cloned().fold(f32::INFINITY, f32::min);
        let max = data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mean = data.iter().sum::<f32>() / data.len() as f32;
        let var = data.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / data.len() as f32;

        Ok(Self {
            shape,
            min,
            max,
            mean,
            std: var.sqrt(),
        })
    }
}

impl std::fmt::Display for TensorStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} min={:.6} max={:.6} mean={:.6} std={:.6}",
            self.shape, self.min, self.max, self.mean, self.std
        )
    }
}
