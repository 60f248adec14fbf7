use crate::config::{LossConfig, LossType};
use crate::TrainError;

const PROB_FLOOR: f32 = 1e-10;
const HUBER_DELTA: f32 = 1.0;

/// Scalar loss plus the gradient of that loss with respect to the
/// predictions. Attribution to model weights is the caller's backward pass.
pub fn compute_loss(
    predictions: &[f32],
    targets: &[f32],
    config: &LossConfig,
) -> Result<(f32, Vec<f32>), TrainError> {
    if predictions.len() != targets.len() {
        return Err(TrainError::Shape {
            expected: targets.len(),
            got: predictions.len(),
        });
    }
    if predictions.is_empty() {
        return Err(TrainError::Shape {
            expected: 1,
            got: 0,
        });
    }

    match config.loss_type {
        LossType::CrossEntropy => Ok(cross_entropy(predictions, targets, config.label_smoothing)),
        LossType::Bce => Ok(bce(predictions, targets)),
        LossType::Mse => Ok(mse(predictions, targets)),
        LossType::Huber => Ok(huber(predictions, targets)),
        LossType::Focal => Ok(focal(predictions, targets, config.focal_gamma)),
        LossType::Contrastive | LossType::Triplet | LossType::Ranking => Err(TrainError::Config(
            format!("loss type {:?} is not implemented", config.loss_type),
        )),
    }
}

/// Numerically stable softmax: subtract the max before exponentiating.
fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

fn cross_entropy(predictions: &[f32], targets: &[f32], smoothing: f32) -> (f32, Vec<f32>) {
    let n = predictions.len();
    let probs = softmax(predictions);
    let mut loss = 0.0;
    let mut grad = vec![0.0; n];
    for i in 0..n {
        // Smoothed target: t' = t * (1 - s) + s / N.
        let smoothed = targets[i] * (1.0 - smoothing) + smoothing / n as f32;
        let p = probs[i].max(PROB_FLOOR);
        loss -= smoothed * p.ln();
        grad[i] = probs[i] - smoothed;
    }
    (loss, grad)
}

fn stable_sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

// The per-element gradient carries the 1/N factor so it matches the averaged
// loss; the source this engine replaces returned it un-normalized.
fn bce(predictions: &[f32], targets: &[f32]) -> (f32, Vec<f32>) {
    let n = predictions.len();
    let mut loss = 0.0;
    let mut grad = vec![0.0; n];
    for i in 0..n {
        let p = stable_sigmoid(predictions[i]);
        let t = targets[i];
        loss -= t * p.max(PROB_FLOOR).ln() + (1.0 - t) * (1.0 - p).max(PROB_FLOOR).ln();
        grad[i] = (p - t) / n as f32;
    }
    (loss / n as f32, grad)
}

fn mse(predictions: &[f32], targets: &[f32]) -> (f32, Vec<f32>) {
    let n = predictions.len();
    let mut loss = 0.0;
    let mut grad = vec![0.0; n];
    for i in 0..n {
        let e = predictions[i] - targets[i];
        loss += e * e;
        grad[i] = 2.0 * e / n as f32;
    }
    (loss / n as f32, grad)
}

fn huber(predictions: &[f32], targets: &[f32]) -> (f32, Vec<f32>) {
    let n = predictions.len();
    let mut loss = 0.0;
    let mut grad = vec![0.0; n];
    for i in 0..n {
        let e = predictions[i] - targets[i];
        if e.abs() <= HUBER_DELTA {
            loss += 0.5 * e * e;
            grad[i] = e / n as f32;
        } else {
            loss += HUBER_DELTA * (e.abs() - 0.5 * HUBER_DELTA);
            grad[i] = HUBER_DELTA * sign(e) / n as f32;
        }
    }
    (loss / n as f32, grad)
}

fn focal(predictions: &[f32], targets: &[f32], gamma: f32) -> (f32, Vec<f32>) {
    let n = predictions.len();
    let probs = softmax(predictions);
    let mut loss = 0.0;
    let mut grad = vec![0.0; n];
    for i in 0..n {
        let p = probs[i].max(PROB_FLOOR);
        let t = targets[i];
        let focus = (1.0 - p).powf(gamma);
        loss -= focus * t * p.ln();
        grad[i] = focus * (gamma * p * p.ln() + p - 1.0) * t;
    }
    (loss, grad)
}

/// Subgradient-friendly sign: zero at zero, unlike `f32::signum`.
pub(crate) fn sign(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LossConfig;

    fn config(loss_type: LossType) -> LossConfig {
        LossConfig {
            loss_type,
            label_smoothing: 0.0,
            ..LossConfig::default()
        }
    }

    #[test]
    fn cross_entropy_uniform_logits() {
        let cfg = config(LossType::CrossEntropy);
        let (loss, grad) = compute_loss(&[0.0, 0.0, 0.0, 0.0], &[1.0, 0.0, 0.0, 0.0], &cfg).unwrap();
        // Uniform softmax over 4 candidates: -ln(0.25).
        assert!((loss - 4.0f32.ln()).abs() < 1e-5);
        assert!((grad[0] - (0.25 - 1.0)).abs() < 1e-6);
        assert!((grad[1] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn cross_entropy_smoothing_shifts_targets() {
        let cfg = LossConfig {
            loss_type: LossType::CrossEntropy,
            label_smoothing: 0.1,
            ..LossConfig::default()
        };
        let (_, grad) = compute_loss(&[0.0, 0.0], &[1.0, 0.0], &cfg).unwrap();
        // t' = [0.95, 0.05]; p = [0.5, 0.5].
        assert!((grad[0] - (0.5 - 0.95)).abs() < 1e-6);
        assert!((grad[1] - (0.5 - 0.05)).abs() < 1e-6);
    }

    #[test]
    fn mse_literal() {
        let cfg = config(LossType::Mse);
        let (loss, grad) = compute_loss(&[1.0, 2.0], &[0.0, 0.0], &cfg).unwrap();
        assert!((loss - 2.5).abs() < 1e-6);
        assert!((grad[0] - 1.0).abs() < 1e-6);
        assert!((grad[1] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn huber_switches_branches_at_delta() {
        let cfg = config(LossType::Huber);
        let (loss, grad) = compute_loss(&[0.5, 3.0], &[0.0, 0.0], &cfg).unwrap();
        // 0.5 * 0.25 + 1 * (3 - 0.5), averaged over 2.
        assert!((loss - (0.125 + 2.5) / 2.0).abs() < 1e-6);
        assert!((grad[0] - 0.25).abs() < 1e-6);
        assert!((grad[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn bce_gradient_is_normalized() {
        let cfg = config(LossType::Bce);
        let (loss, grad) = compute_loss(&[0.0, 0.0], &[1.0, 0.0], &cfg).unwrap();
        assert!(loss.is_finite());
        assert!((grad[0] - (0.5 - 1.0) / 2.0).abs() < 1e-6);
        assert!((grad[1] - 0.5 / 2.0).abs() < 1e-6);
    }

    #[test]
    fn focal_downweights_confident_predictions() {
        let cfg = config(LossType::Focal);
        let (confident, _) = compute_loss(&[4.0, 0.0], &[1.0, 0.0], &cfg).unwrap();
        let (uncertain, grad) = compute_loss(&[0.0, 0.0], &[1.0, 0.0], &cfg).unwrap();
        assert!(confident < uncertain);
        assert!(grad.iter().all(|g| g.is_finite()));
    }

    #[test]
    fn length_mismatch_is_a_shape_error() {
        let cfg = config(LossType::Mse);
        let err = compute_loss(&[1.0, 2.0], &[1.0], &cfg).unwrap_err();
        assert!(matches!(err, TrainError::Shape { expected: 1, got: 2 }));
    }

    #[test]
    fn unimplemented_loss_is_a_config_error() {
        for loss_type in [LossType::Contrastive, LossType::Triplet, LossType::Ranking] {
            let err = compute_loss(&[1.0], &[1.0], &config(loss_type)).unwrap_err();
            assert!(matches!(err, TrainError::Config(_)));
        }
    }
}
