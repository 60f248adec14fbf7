use std::f32::consts::TAU;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::TrainError;

/// Dense float32 buffer with a shape and an optional gradient buffer.
///
/// The gradient, when present, always has the same length as `data`.
/// All mutation happens in place; the optimizer, constraint projections and
/// pruning masks write directly into `data` and `grad`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tensor {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
    pub grad: Option<Vec<f32>>,
    pub requires_grad: bool,
}

impl Tensor {
    pub fn zeros(shape: &[usize]) -> Self {
        let numel = shape.iter().product();
        Self {
            data: vec![0.0; numel],
            shape: shape.to_vec(),
            grad: None,
            requires_grad: false,
        }
    }

    /// Standard-normal samples via the Box-Muller transform, multiplied by
    /// `scale`. Uniforms are drawn in `(0, 1)` so the log never sees zero.
    pub fn randn(shape: &[usize], scale: f32, rng: &mut impl Rng) -> Self {
        let mut tensor = Self::zeros(shape);
        for x in tensor.data.iter_mut() {
            let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
            let u2: f32 = rng.gen_range(f32::EPSILON..1.0);
            *x = (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos() * scale;
        }
        tensor
    }

    pub fn from_data(data: Vec<f32>, shape: &[usize]) -> Result<Self, TrainError> {
        let numel: usize = shape.iter().product();
        if shape.is_empty() || shape.contains(&0) || data.len() != numel {
            return Err(TrainError::Shape {
                expected: numel,
                got: data.len(),
            });
        }
        Ok(Self {
            data,
            shape: shape.to_vec(),
            grad: None,
            requires_grad: false,
        })
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn l2_norm(&self) -> f32 {
        self.data.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    pub fn l1_norm(&self) -> f32 {
        self.data.iter().map(|x| x.abs()).sum()
    }

    pub fn nnz(&self) -> usize {
        self.data.iter().filter(|&&x| x != 0.0).count()
    }

    pub fn sparsity(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        1.0 - self.nnz() as f32 / self.data.len() as f32
    }

    /// No-op when no gradient buffer has been allocated.
    pub fn zero_grad(&mut self) {
        if let Some(grad) = self.grad.as_mut() {
            grad.fill(0.0);
        }
    }

    pub fn ensure_grad(&mut self) -> &mut Vec<f32> {
        let numel = self.data.len();
        self.grad.get_or_insert_with(|| vec![0.0; numel])
    }
}

/// Flat, named set of trainable tensors.
///
/// Names are stable identifiers that key pruning masks, per-layer constraint
/// records and optimizer state. Registration is one-shot; membership never
/// changes once training has begun. Iteration order is insertion order, which
/// keeps slot-indexed optimizer state aligned across calls.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ParameterSet {
    entries: Vec<(String, Tensor)>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, mut tensor: Tensor) -> Result<(), TrainError> {
        if self.entries.iter().any(|(n, _)| n == name) {
            return Err(TrainError::State(format!(
                "parameter {name:?} is already registered"
            )));
        }
        tensor.requires_grad = true;
        tensor.ensure_grad();
        self.entries.push((name.to_string(), tensor));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.entries
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries.iter().map(|(n, t)| (n.as_str(), t))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Tensor)> {
        self.entries.iter_mut().map(|(n, t)| (n.as_str(), t))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn zero_grad(&mut self) {
        for (_, tensor) in self.entries.iter_mut() {
            tensor.zero_grad();
        }
    }

    /// Total number of elements across all registered tensors.
    pub fn total_numel(&self) -> usize {
        self.entries.iter().map(|(_, t)| t.numel()).sum()
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::SmallRng, SeedableRng};

    use super::*;

    #[test]
    fn shape_product_matches_len() {
        let t = Tensor::zeros(&[3, 4]);
        assert_eq!(t.numel(), 12);
        assert_eq!(t.shape.iter().product::<usize>(), t.data.len());
    }

    #[test]
    fn from_data_rejects_mismatched_shape() {
        let err = Tensor::from_data(vec![1.0, 2.0, 3.0], &[2, 2]).unwrap_err();
        assert!(matches!(err, TrainError::Shape { expected: 4, got: 3 }));
    }

    #[test]
    fn randn_is_deterministic_under_seed() {
        let mut a = SmallRng::seed_from_u64(42);
        let mut b = SmallRng::seed_from_u64(42);
        let x = Tensor::randn(&[16], 0.5, &mut a);
        let y = Tensor::randn(&[16], 0.5, &mut b);
        assert_eq!(x.data, y.data);
        assert!(x.data.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn sparsity_counts_zeros() {
        let t = Tensor::from_data(vec![0.0, 1.0, 0.0, -2.0], &[4]).unwrap();
        assert_eq!(t.nnz(), 2);
        assert!((t.sparsity() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn zero_grad_is_noop_without_buffer() {
        let mut t = Tensor::zeros(&[2]);
        t.zero_grad();
        assert!(t.grad.is_none());
        t.ensure_grad()[0] = 3.0;
        t.zero_grad();
        assert_eq!(t.grad.as_ref().unwrap(), &vec![0.0, 0.0]);
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut params = ParameterSet::new();
        params.register("output", Tensor::zeros(&[2])).unwrap();
        let err = params.register("output", Tensor::zeros(&[2])).unwrap_err();
        assert!(matches!(err, TrainError::State(_)));
    }
}
