use crate::config::{
    BoundedConfig, ConstraintAxis, ConstraintKind, GradientConstraintConfig,
    WeightConstraintConfig,
};
use crate::loss::sign;
use crate::tensor::{ParameterSet, Tensor};
use crate::TrainError;

const NORM_FLOOR: f32 = 1e-10;

/// Project a tensor into the feasible set described by `cfg`, in place.
///
/// Every projection is idempotent: applying it twice moves the tensor only
/// within floating-point tolerance of the first application.
pub fn apply_weight_constraint(
    tensor: &mut Tensor,
    cfg: &WeightConstraintConfig,
) -> Result<(), TrainError> {
    match cfg.constraint {
        ConstraintKind::None => Ok(()),
        ConstraintKind::MaxNorm => scale_by_norm(tensor, cfg.axis, |norm| {
            if norm > cfg.max_norm {
                Some(cfg.max_norm / norm)
            } else {
                None
            }
        }),
        ConstraintKind::UnitNorm => scale_by_norm(tensor, cfg.axis, |norm| {
            if norm > NORM_FLOOR {
                Some(1.0 / norm)
            } else {
                None
            }
        }),
        ConstraintKind::MinMax => {
            for x in tensor.data.iter_mut() {
                *x = x.clamp(cfg.min_value, cfg.max_value);
            }
            Ok(())
        }
        ConstraintKind::NonNegative => {
            for x in tensor.data.iter_mut() {
                *x = x.max(0.0);
            }
            Ok(())
        }
        ConstraintKind::Spectral => {
            spectral_normalize(tensor, cfg.power_iterations);
            Ok(())
        }
    }
}

/// Shared body of the norm-based projections: compute the L2 norm of each
/// slice selected by `axis`, ask `rescale` for a factor, apply it.
fn scale_by_norm(
    tensor: &mut Tensor,
    axis: ConstraintAxis,
    rescale: impl Fn(f32) -> Option<f32>,
) -> Result<(), TrainError> {
    match axis {
        ConstraintAxis::Global => {
            let norm = tensor.l2_norm();
            if let Some(factor) = rescale(norm) {
                for x in tensor.data.iter_mut() {
                    *x *= factor;
                }
            }
            Ok(())
        }
        ConstraintAxis::Row => {
            let (_, cols) = require_2d(tensor)?;
            for row in tensor.data.chunks_mut(cols) {
                let norm = row.iter().map(|x| x * x).sum::<f32>().sqrt();
                if let Some(factor) = rescale(norm) {
                    for x in row.iter_mut() {
                        *x *= factor;
                    }
                }
            }
            Ok(())
        }
        ConstraintAxis::Column => {
            let (rows, cols) = require_2d(tensor)?;
            for j in 0..cols {
                let norm = (0..rows)
                    .map(|i| {
                        let x = tensor.data[i * cols + j];
                        x * x
                    })
                    .sum::<f32>()
                    .sqrt();
                if let Some(factor) = rescale(norm) {
                    for i in 0..rows {
                        tensor.data[i * cols + j] *= factor;
                    }
                }
            }
            Ok(())
        }
    }
}

fn require_2d(tensor: &Tensor) -> Result<(usize, usize), TrainError> {
    if tensor.ndim() != 2 {
        return Err(TrainError::Shape {
            expected: 2,
            got: tensor.ndim(),
        });
    }
    Ok((tensor.shape[0], tensor.shape[1]))
}

/// Approximate the largest singular value by power iteration and divide the
/// whole tensor by it when it exceeds one. Non-2-D tensors are unchanged.
///
/// The iteration starts from a fixed uniform vector, so the estimate is
/// deterministic. One iteration is a coarse estimate for ill-conditioned
/// matrices; the count is configurable.
fn spectral_normalize(tensor: &mut Tensor, iterations: usize) {
    if tensor.ndim() != 2 {
        return;
    }
    let (rows, cols) = (tensor.shape[0], tensor.shape[1]);
    let w = &tensor.data;
    let mut v = vec![1.0 / (cols as f32).sqrt(); cols];
    let mut u = vec![0.0; rows];
    for _ in 0..iterations.max(1) {
        for i in 0..rows {
            u[i] = (0..cols).map(|j| w[i * cols + j] * v[j]).sum();
        }
        normalize(&mut u);
        for j in 0..cols {
            v[j] = (0..rows).map(|i| w[i * cols + j] * u[i]).sum();
        }
        normalize(&mut v);
    }
    let sigma: f32 = (0..rows)
        .map(|i| {
            let wv: f32 = (0..cols).map(|j| w[i * cols + j] * v[j]).sum();
            u[i] * wv
        })
        .sum();
    if sigma > 1.0 {
        for x in tensor.data.iter_mut() {
            *x /= sigma;
        }
    }
}

fn normalize(x: &mut [f32]) {
    let norm = x.iter().map(|v| v * v).sum::<f32>().sqrt() + NORM_FLOOR;
    for v in x.iter_mut() {
        *v /= norm;
    }
}

/// Global L2 norm over every gradient buffer in the set.
pub fn global_grad_norm(params: &ParameterSet) -> f32 {
    params
        .iter()
        .filter_map(|(_, t)| t.grad.as_ref())
        .flat_map(|g| g.iter())
        .map(|g| g * g)
        .sum::<f32>()
        .sqrt()
}

/// Clip gradients across the whole parameter group and return the pre-clip
/// global norm. Norm clipping runs before value clipping. Disabled clipping
/// returns zero without touching anything.
pub fn apply_gradient_constraints(params: &mut ParameterSet, cfg: &GradientConstraintConfig) -> f32 {
    if !cfg.clip_gradients {
        return 0.0;
    }
    let total_norm = global_grad_norm(params);
    if let Some(clip_norm) = cfg.clip_norm {
        if total_norm > clip_norm {
            let scale = clip_norm / total_norm;
            for (_, tensor) in params.iter_mut() {
                if let Some(grad) = tensor.grad.as_mut() {
                    for g in grad.iter_mut() {
                        *g *= scale;
                    }
                }
            }
        }
    }
    if let Some(clip_value) = cfg.clip_value {
        for (_, tensor) in params.iter_mut() {
            if let Some(grad) = tensor.grad.as_mut() {
                for g in grad.iter_mut() {
                    *g = g.clamp(-clip_value, clip_value);
                }
            }
        }
    }
    total_norm
}

/// Inject the elastic-net subgradient into each parameter's gradient buffer.
///
/// l1 term: `l1 * ratio * sign(w)`; l2 term: `2 * l2 * (1 - ratio) * w`.
pub fn apply_regularization(params: &mut ParameterSet, cfg: &BoundedConfig) {
    if cfg.l1_regularization == 0.0 && cfg.l2_regularization == 0.0 {
        return;
    }
    let l1_scale = cfg.l1_regularization * cfg.elastic_net_ratio;
    let l2_scale = cfg.l2_regularization * (1.0 - cfg.elastic_net_ratio);
    for (_, tensor) in params.iter_mut() {
        let Tensor { data, grad, .. } = tensor;
        let Some(grad) = grad.as_mut() else { continue };
        for (g, &w) in grad.iter_mut().zip(data.iter()) {
            *g += l1_scale * sign(w) + 2.0 * l2_scale * w;
        }
    }
}

/// Loss-scaling hook for mixed-precision runs: prediction gradients are
/// scaled up before the backward pass and unscaled before clipping, so clip
/// thresholds keep their unscaled meaning.
#[derive(Debug, Clone, Copy)]
pub struct GradScaler {
    scale: f32,
}

pub const DEFAULT_LOSS_SCALE: f32 = 1024.0;

impl GradScaler {
    pub fn new(scale: f32) -> Self {
        Self { scale }
    }

    pub fn scale(&self, grad: &mut [f32]) {
        for g in grad.iter_mut() {
            *g *= self.scale;
        }
    }

    pub fn unscale(&self, params: &mut ParameterSet) {
        for (_, tensor) in params.iter_mut() {
            if let Some(grad) = tensor.grad.as_mut() {
                for g in grad.iter_mut() {
                    *g /= self.scale;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConstraintAxis, ConstraintKind, WeightConstraintConfig};

    fn max_norm(max: f32, axis: ConstraintAxis) -> WeightConstraintConfig {
        WeightConstraintConfig {
            constraint: ConstraintKind::MaxNorm,
            max_norm: max,
            axis,
            ..WeightConstraintConfig::default()
        }
    }

    #[test]
    fn global_max_norm_bounds_the_tensor() {
        let mut t = Tensor::from_data(vec![3.0, 4.0], &[2]).unwrap();
        apply_weight_constraint(&mut t, &max_norm(2.5, ConstraintAxis::Global)).unwrap();
        assert!(t.l2_norm() <= 2.5 + 1e-5);
        assert!((t.data[0] - 1.5).abs() < 1e-6);
        assert!((t.data[1] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn max_norm_below_threshold_is_identity() {
        let mut t = Tensor::from_data(vec![0.3, 0.4], &[2]).unwrap();
        apply_weight_constraint(&mut t, &max_norm(2.5, ConstraintAxis::Global)).unwrap();
        assert_eq!(t.data, vec![0.3, 0.4]);
    }

    #[test]
    fn row_max_norm_rescales_rows_independently() {
        let mut t = Tensor::from_data(vec![3.0, 4.0, 0.1, 0.1], &[2, 2]).unwrap();
        apply_weight_constraint(&mut t, &max_norm(1.0, ConstraintAxis::Row)).unwrap();
        let first_row = (t.data[0] * t.data[0] + t.data[1] * t.data[1]).sqrt();
        assert!((first_row - 1.0).abs() < 1e-5);
        // Second row was already inside the ball.
        assert_eq!(&t.data[2..], &[0.1, 0.1]);
    }

    #[test]
    fn column_max_norm_rescales_columns() {
        let mut t = Tensor::from_data(vec![3.0, 0.1, 4.0, 0.1], &[2, 2]).unwrap();
        apply_weight_constraint(&mut t, &max_norm(1.0, ConstraintAxis::Column)).unwrap();
        let col0 = (t.data[0] * t.data[0] + t.data[2] * t.data[2]).sqrt();
        assert!((col0 - 1.0).abs() < 1e-5);
        assert!((t.data[1] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn row_axis_on_1d_is_a_shape_error() {
        let mut t = Tensor::from_data(vec![1.0, 2.0], &[2]).unwrap();
        let err = apply_weight_constraint(&mut t, &max_norm(1.0, ConstraintAxis::Row)).unwrap_err();
        assert!(matches!(err, TrainError::Shape { expected: 2, got: 1 }));
    }

    #[test]
    fn unit_norm_row_normalizes_each_row() {
        let mut t = Tensor::from_data(vec![3.0, 4.0, 0.0, 0.0], &[2, 2]).unwrap();
        let cfg = WeightConstraintConfig {
            constraint: ConstraintKind::UnitNorm,
            axis: ConstraintAxis::Row,
            ..WeightConstraintConfig::default()
        };
        apply_weight_constraint(&mut t, &cfg).unwrap();
        let first_row = (t.data[0] * t.data[0] + t.data[1] * t.data[1]).sqrt();
        assert!((first_row - 1.0).abs() < 1e-5);
        // Zero rows stay untouched instead of dividing by ~0.
        assert_eq!(&t.data[2..], &[0.0, 0.0]);
    }

    #[test]
    fn constraints_are_idempotent() {
        let configs = [
            max_norm(1.0, ConstraintAxis::Global),
            WeightConstraintConfig {
                constraint: ConstraintKind::UnitNorm,
                axis: ConstraintAxis::Global,
                ..WeightConstraintConfig::default()
            },
            WeightConstraintConfig {
                constraint: ConstraintKind::MinMax,
                min_value: -0.5,
                max_value: 0.5,
                ..WeightConstraintConfig::default()
            },
            WeightConstraintConfig {
                constraint: ConstraintKind::NonNegative,
                ..WeightConstraintConfig::default()
            },
        ];
        for cfg in configs {
            let mut t = Tensor::from_data(vec![3.0, -4.0, 0.2, -0.1], &[4]).unwrap();
            apply_weight_constraint(&mut t, &cfg).unwrap();
            let once = t.data.clone();
            apply_weight_constraint(&mut t, &cfg).unwrap();
            for (a, b) in once.iter().zip(t.data.iter()) {
                assert!((a - b).abs() < 1e-6, "{cfg:?} moved after reapplication");
            }
        }
    }

    #[test]
    fn spectral_caps_the_top_singular_value() {
        let mut t = Tensor::from_data(vec![3.0, 0.0, 0.0, 0.5], &[2, 2]).unwrap();
        let cfg = WeightConstraintConfig {
            constraint: ConstraintKind::Spectral,
            power_iterations: 10,
            ..WeightConstraintConfig::default()
        };
        apply_weight_constraint(&mut t, &cfg).unwrap();
        // Diagonal matrix: sigma is exactly the largest diagonal entry.
        assert!((t.data[0] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn spectral_leaves_1d_tensors_alone() {
        let mut t = Tensor::from_data(vec![5.0, 5.0], &[2]).unwrap();
        let cfg = WeightConstraintConfig {
            constraint: ConstraintKind::Spectral,
            ..WeightConstraintConfig::default()
        };
        apply_weight_constraint(&mut t, &cfg).unwrap();
        assert_eq!(t.data, vec![5.0, 5.0]);
    }

    #[test]
    fn global_clipping_scales_all_groups() {
        let mut params = ParameterSet::new();
        params.register("a", Tensor::zeros(&[2])).unwrap();
        params.register("b", Tensor::zeros(&[2])).unwrap();
        params.get_mut("a").unwrap().grad = Some(vec![3.0, 4.0]);
        params.get_mut("b").unwrap().grad = Some(vec![0.0, 0.0]);

        let cfg = GradientConstraintConfig {
            clip_gradients: true,
            clip_norm: Some(2.5),
            clip_value: None,
            enable_gradient_scaling: false,
        };
        let norm = apply_gradient_constraints(&mut params, &cfg);
        assert!((norm - 5.0).abs() < 1e-6);
        assert_eq!(params.get("a").unwrap().grad.as_ref().unwrap(), &vec![1.5, 2.0]);
        assert_eq!(params.get("b").unwrap().grad.as_ref().unwrap(), &vec![0.0, 0.0]);
        assert!(global_grad_norm(&params) <= 2.5 + 1e-5);
    }

    #[test]
    fn value_clipping_clamps_elementwise() {
        let mut params = ParameterSet::new();
        params.register("a", Tensor::zeros(&[2])).unwrap();
        params.get_mut("a").unwrap().grad = Some(vec![0.9, -0.9]);
        let cfg = GradientConstraintConfig {
            clip_gradients: true,
            clip_norm: None,
            clip_value: Some(0.5),
            enable_gradient_scaling: false,
        };
        apply_gradient_constraints(&mut params, &cfg);
        assert_eq!(params.get("a").unwrap().grad.as_ref().unwrap(), &vec![0.5, -0.5]);
    }

    #[test]
    fn disabled_clipping_has_no_side_effects() {
        let mut params = ParameterSet::new();
        params.register("a", Tensor::zeros(&[2])).unwrap();
        params.get_mut("a").unwrap().grad = Some(vec![30.0, 40.0]);
        let cfg = GradientConstraintConfig {
            clip_gradients: false,
            clip_norm: Some(1.0),
            clip_value: Some(1.0),
            enable_gradient_scaling: false,
        };
        assert_eq!(apply_gradient_constraints(&mut params, &cfg), 0.0);
        assert_eq!(params.get("a").unwrap().grad.as_ref().unwrap(), &vec![30.0, 40.0]);
    }

    #[test]
    fn elastic_net_injects_both_terms() {
        let mut params = ParameterSet::new();
        params
            .register("w", Tensor::from_data(vec![2.0, -3.0], &[2]).unwrap())
            .unwrap();
        let cfg = BoundedConfig {
            l1_regularization: 0.1,
            l2_regularization: 0.2,
            elastic_net_ratio: 0.5,
            ..BoundedConfig::default()
        };
        apply_regularization(&mut params, &cfg);
        let grad = params.get("w").unwrap().grad.as_ref().unwrap().clone();
        // l1_scale = 0.05, l2_scale = 0.1: 0.05 * sign(w) + 0.2 * w.
        assert!((grad[0] - (0.05 + 0.4)).abs() < 1e-6);
        assert!((grad[1] - (-0.05 - 0.6)).abs() < 1e-6);
    }

    #[test]
    fn zero_coefficients_skip_regularization() {
        let mut params = ParameterSet::new();
        params
            .register("w", Tensor::from_data(vec![2.0], &[1]).unwrap())
            .unwrap();
        let cfg = BoundedConfig {
            l1_regularization: 0.0,
            l2_regularization: 0.0,
            elastic_net_ratio: 0.5,
            ..BoundedConfig::default()
        };
        apply_regularization(&mut params, &cfg);
        assert_eq!(params.get("w").unwrap().grad.as_ref().unwrap(), &vec![0.0]);
    }

    #[test]
    fn grad_scaler_round_trips() {
        let mut params = ParameterSet::new();
        params.register("w", Tensor::zeros(&[2])).unwrap();
        let scaler = GradScaler::new(DEFAULT_LOSS_SCALE);
        let mut dpred = vec![1.0, -2.0];
        scaler.scale(&mut dpred);
        assert_eq!(dpred, vec![1024.0, -2048.0]);
        params.get_mut("w").unwrap().grad = Some(dpred);
        scaler.unscale(&mut params);
        assert_eq!(params.get("w").unwrap().grad.as_ref().unwrap(), &vec![1.0, -2.0]);
    }
}
