use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Shape errors raised by tensor construction and arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TensorError {
    /// The number of values does not fill the requested shape.
    #[error("cannot shape {len} values as {shape:?}")]
    SizeMismatch {
        /// Requested shape.
        shape: Vec<usize>,
        /// Number of values supplied.
        len: usize,
    },
    /// Two operands of an element-wise operation differ in shape.
    #[error("shape mismatch: {0:?} vs {1:?}")]
    ShapeMismatch(Vec<usize>, Vec<usize>),
    /// A row-wise accessor was used on a tensor that is not two-dimensional.
    #[error("expected a 2-d tensor, got shape {0:?}")]
    NotMatrix(Vec<usize>),
}

/// Dense row-major `f32` tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    blob: Vec<f32>,
}

impl Tensor {
    /// Wraps `blob` with `shape`, checking that the sizes agree.
    pub fn raw(shape: &[usize], blob: Vec<f32>) -> Result<Self, TensorError> {
        if shape.iter().product::<usize>() != blob.len() {
            return Err(TensorError::SizeMismatch {
                shape: shape.to_vec(),
                len: blob.len(),
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            blob,
        })
    }

    /// All zeros.
    #[must_use]
    pub fn zeros(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            blob: vec![0.0; shape.iter().product()],
        }
    }

    /// Normally distributed values scaled by `1/sqrt(fan_in)`, where fan-in is
    /// the leading dimension.
    pub fn rand<R: Rng>(rng: &mut R, shape: &[usize]) -> Self {
        let fan_in = shape.first().copied().unwrap_or(1).max(1);
        let std = (1.0 / fan_in as f32).sqrt();
        Self {
            shape: shape.to_vec(),
            blob: (0..shape.iter().product::<usize>())
                .map(|_| {
                    let z: f32 = StandardNormal.sample(&mut *rng);
                    z * std
                })
                .collect(),
        }
    }

    /// Shape of the tensor.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements.
    #[must_use]
    pub fn size(&self) -> usize {
        self.blob.len()
    }

    /// Flat values in row-major order.
    #[must_use]
    pub fn blob(&self) -> &[f32] {
        &self.blob
    }

    /// Mutable flat values.
    pub fn blob_mut(&mut self) -> &mut [f32] {
        &mut self.blob
    }

    /// Row `i` of a 2-d tensor.
    ///
    /// # Panics
    /// If the tensor is not 2-d or `i` is out of range.
    #[must_use]
    pub fn row(&self, i: usize) -> &[f32] {
        let cols = self.shape[1];
        &self.blob[i * cols..(i + 1) * cols]
    }

    /// Mutable row `i` of a 2-d tensor.
    pub fn row_mut(&mut self, i: usize) -> &mut [f32] {
        let cols = self.shape[1];
        &mut self.blob[i * cols..(i + 1) * cols]
    }

    /// Element-wise `self += other`.
    pub fn add_assign(&mut self, other: &Self) -> Result<(), TensorError> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch(
                self.shape.clone(),
                other.shape.clone(),
            ));
        }
        for (a, b) in self.blob.iter_mut().zip(&other.blob) {
            *a += b;
        }
        Ok(())
    }

    /// `x · self` for a 2-d tensor of shape `[x.len(), n]`, written into `out`.
    pub fn vec_mul_into(&self, x: &[f32], out: &mut [f32]) -> Result<(), TensorError> {
        let (rows, cols) = self.dims2()?;
        if x.len() != rows || out.len() != cols {
            return Err(TensorError::ShapeMismatch(
                vec![x.len(), out.len()],
                self.shape.clone(),
            ));
        }
        for (xi, row) in x.iter().zip(self.blob.chunks_exact(cols)) {
            if *xi == 0.0 {
                continue;
            }
            for (o, w) in out.iter_mut().zip(row) {
                *o += xi * w;
            }
        }
        Ok(())
    }

    /// `self · y` for a 2-d tensor of shape `[m, y.len()]`, written into `out`.
    pub fn mul_vec_into(&self, y: &[f32], out: &mut [f32]) -> Result<(), TensorError> {
        let (rows, cols) = self.dims2()?;
        if y.len() != cols || out.len() != rows {
            return Err(TensorError::ShapeMismatch(
                self.shape.clone(),
                vec![out.len(), y.len()],
            ));
        }
        for (o, row) in out.iter_mut().zip(self.blob.chunks_exact(cols)) {
            *o += row.iter().zip(y).map(|(w, v)| w * v).sum::<f32>();
        }
        Ok(())
    }

    /// Rank-one update `self += x ⊗ y` for a 2-d tensor of shape `[x.len(), y.len()]`.
    pub fn add_outer(&mut self, x: &[f32], y: &[f32]) -> Result<(), TensorError> {
        let (rows, cols) = self.dims2()?;
        if x.len() != rows || y.len() != cols {
            return Err(TensorError::ShapeMismatch(
                self.shape.clone(),
                vec![x.len(), y.len()],
            ));
        }
        for (xi, row) in x.iter().zip(self.blob.chunks_exact_mut(cols)) {
            if *xi == 0.0 {
                continue;
            }
            for (r, v) in row.iter_mut().zip(y) {
                *r += xi * v;
            }
        }
        Ok(())
    }

    fn dims2(&self) -> Result<(usize, usize), TensorError> {
        match self.shape.as_slice() {
            [rows, cols] => Ok((*rows, *cols)),
            _ => Err(TensorError::NotMatrix(self.shape.clone())),
        }
    }
}

/// In-place softmax over `logits`.
pub(crate) fn softmax_in_place(logits: &mut [f32]) {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in logits.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in logits.iter_mut() {
        *v /= sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_raw_checks_size() {
        assert!(Tensor::raw(&[2, 3], vec![0.0; 6]).is_ok());
        assert!(matches!(
            Tensor::raw(&[2, 3], vec![0.0; 5]),
            Err(TensorError::SizeMismatch { len: 5, .. })
        ));
    }

    #[test]
    fn test_vec_mul_and_mul_vec() {
        // [[1, 2], [3, 4], [5, 6]]
        let m = Tensor::raw(&[3, 2], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let mut out = vec![0.0; 2];
        m.vec_mul_into(&[1.0, 0.0, 1.0], &mut out).unwrap();
        assert_eq!(out, vec![6.0, 8.0]);

        let mut out = vec![0.0; 3];
        m.mul_vec_into(&[1.0, 1.0], &mut out).unwrap();
        assert_eq!(out, vec![3.0, 7.0, 11.0]);
    }

    #[test]
    fn test_add_outer() {
        let mut m = Tensor::zeros(&[2, 2]);
        m.add_outer(&[1.0, 2.0], &[3.0, 4.0]).unwrap();
        assert_eq!(m.blob(), &[3.0, 4.0, 6.0, 8.0]);
        assert!(m.add_outer(&[1.0], &[1.0, 1.0]).is_err());
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let mut v = vec![1.0, 2.0, 3.0, 1000.0];
        softmax_in_place(&mut v);
        assert!((v.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(v[3] > 0.99);
    }

    #[test]
    fn test_rand_is_seeded() {
        let a = Tensor::rand(&mut StdRng::seed_from_u64(7), &[4, 3]);
        let b = Tensor::rand(&mut StdRng::seed_from_u64(7), &[4, 3]);
        assert_eq!(a, b);
        assert_eq!(a.size(), 12);
    }
}
