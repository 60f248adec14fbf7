use serde::{Deserialize, Serialize};

use crate::config::{OptimizerConfig, OptimizerType};
use crate::tensor::{ParameterSet, Tensor};
use crate::TrainError;

/// Optimizer suite over a flat parameter set.
///
/// State is indexed by parameter slot (the set's stable insertion order) and
/// allocated lazily on the first step that sees a gradient for that slot.
/// `state_view` exports it keyed by registered name so checkpoints survive
/// re-registration order games.
#[derive(Debug)]
pub enum Optimizer {
    Sgd(Sgd),
    Adam(Adam),
}

impl Optimizer {
    pub fn from_config(cfg: &OptimizerConfig) -> Result<Self, TrainError> {
        match cfg.optimizer_type {
            OptimizerType::Sgd => Ok(Optimizer::Sgd(Sgd {
                learning_rate: cfg.learning_rate,
                momentum: cfg.momentum,
                nesterov: cfg.nesterov,
                velocity: Vec::new(),
            })),
            OptimizerType::Adam | OptimizerType::AdamW => Ok(Optimizer::Adam(Adam {
                learning_rate: cfg.learning_rate,
                beta_1: cfg.beta1,
                beta_2: cfg.beta2,
                epsilon: cfg.epsilon,
                weight_decay: cfg.weight_decay,
                decoupled: cfg.optimizer_type == OptimizerType::AdamW,
                m: Vec::new(),
                v: Vec::new(),
                t: 0,
            })),
            OptimizerType::Rmsprop
            | OptimizerType::Adagrad
            | OptimizerType::Lamb
            | OptimizerType::Sophia => Err(TrainError::Config(format!(
                "optimizer type {:?} is not implemented",
                cfg.optimizer_type
            ))),
        }
    }

    pub fn step(&mut self, params: &mut ParameterSet) {
        match self {
            Optimizer::Sgd(sgd) => sgd.step(params),
            Optimizer::Adam(adam) => adam.step(params),
        }
    }

    pub fn zero_grad(&mut self, params: &mut ParameterSet) {
        params.zero_grad();
    }

    pub fn get_lr(&self) -> f32 {
        match self {
            Optimizer::Sgd(sgd) => sgd.learning_rate,
            Optimizer::Adam(adam) => adam.learning_rate,
        }
    }

    pub fn set_lr(&mut self, lr: f32) {
        match self {
            Optimizer::Sgd(sgd) => sgd.learning_rate = lr,
            Optimizer::Adam(adam) => adam.learning_rate = lr,
        }
    }

    /// Opaque, serializable view of the optimizer state, keyed by parameter
    /// name. Checkpoint placement is the caller's concern.
    pub fn state_view(&self, params: &ParameterSet) -> OptimizerState {
        let named = |stats: &[Option<Vec<f32>>]| -> Vec<(String, Vec<f32>)> {
            params
                .iter()
                .enumerate()
                .filter_map(|(i, (name, _))| {
                    stats
                        .get(i)
                        .and_then(|s| s.as_ref())
                        .map(|s| (name.to_string(), s.clone()))
                })
                .collect()
        };
        match self {
            Optimizer::Sgd(sgd) => OptimizerState::Sgd {
                velocity: named(&sgd.velocity),
            },
            Optimizer::Adam(adam) => OptimizerState::Adam {
                step: adam.t,
                m: named(&adam.m),
                v: named(&adam.v),
            },
        }
    }

    pub fn load_state(
        &mut self,
        state: OptimizerState,
        params: &ParameterSet,
    ) -> Result<(), TrainError> {
        let slotted = |named: Vec<(String, Vec<f32>)>| -> Result<Vec<Option<Vec<f32>>>, TrainError> {
            let mut slots = vec![None; params.len()];
            for (name, stat) in named {
                let slot = params
                    .iter()
                    .position(|(n, _)| n == name)
                    .ok_or_else(|| TrainError::State(format!("unknown parameter {name:?}")))?;
                slots[slot] = Some(stat);
            }
            Ok(slots)
        };
        match (self, state) {
            (Optimizer::Sgd(sgd), OptimizerState::Sgd { velocity }) => {
                sgd.velocity = slotted(velocity)?;
                Ok(())
            }
            (Optimizer::Adam(adam), OptimizerState::Adam { step, m, v }) => {
                adam.t = step;
                adam.m = slotted(m)?;
                adam.v = slotted(v)?;
                Ok(())
            }
            _ => Err(TrainError::State(
                "optimizer state does not match optimizer type".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OptimizerState {
    Sgd {
        velocity: Vec<(String, Vec<f32>)>,
    },
    Adam {
        step: u64,
        m: Vec<(String, Vec<f32>)>,
        v: Vec<(String, Vec<f32>)>,
    },
}

fn slot<'a>(stats: &'a mut Vec<Option<Vec<f32>>>, index: usize, len: usize) -> &'a mut Vec<f32> {
    if stats.len() <= index {
        stats.resize(index + 1, None);
    }
    stats[index].get_or_insert_with(|| vec![0.0; len])
}

#[derive(Debug)]
pub struct Sgd {
    pub learning_rate: f32,
    pub momentum: f32,
    pub nesterov: bool,
    velocity: Vec<Option<Vec<f32>>>,
}

impl Sgd {
    fn step(&mut self, params: &mut ParameterSet) {
        for (i, (_, tensor)) in params.iter_mut().enumerate() {
            let Tensor { data, grad, .. } = tensor;
            let Some(grad) = grad.as_ref() else { continue };
            let velocity = slot(&mut self.velocity, i, data.len());
            for ((w, &g), v) in data.iter_mut().zip(grad.iter()).zip(velocity.iter_mut()) {
                // v = momentum * v + g
                *v = self.momentum * *v + g;
                if self.nesterov {
                    *w -= self.learning_rate * (g + self.momentum * *v);
                } else {
                    *w -= self.learning_rate * *v;
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct Adam {
    pub learning_rate: f32,
    pub beta_1: f32,
    pub beta_2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
    decoupled: bool,
    m: Vec<Option<Vec<f32>>>,
    v: Vec<Option<Vec<f32>>>,
    t: u64,
}

impl Adam {
    fn step(&mut self, params: &mut ParameterSet) {
        // One global step per call, not per parameter.
        self.t += 1;
        let bias_1 = 1.0 - self.beta_1.powi(self.t as i32);
        let bias_2 = 1.0 - self.beta_2.powi(self.t as i32);
        let coupled_decay = if self.decoupled { 0.0 } else { self.weight_decay };

        for (i, (_, tensor)) in params.iter_mut().enumerate() {
            let Tensor { data, grad, .. } = tensor;
            let Some(grad) = grad.as_ref() else { continue };
            let n = data.len();
            let m = slot(&mut self.m, i, n);
            for (m, (&g, &w)) in m.iter_mut().zip(grad.iter().zip(data.iter())) {
                let g = g + coupled_decay * w;
                // m = beta_1 * m + (1 - beta_1) * g
                *m = self.beta_1 * *m + (1.0 - self.beta_1) * g;
            }
            let v = slot(&mut self.v, i, n);
            for (v, (&g, &w)) in v.iter_mut().zip(grad.iter().zip(data.iter())) {
                let g = g + coupled_decay * w;
                // v = beta_2 * v + (1 - beta_2) * g^2
                *v = self.beta_2 * *v + (1.0 - self.beta_2) * g * g;
            }
            let m = self.m[i].as_ref().map(|m| m.as_slice()).unwrap_or(&[]);
            let v = self.v[i].as_ref().map(|v| v.as_slice()).unwrap_or(&[]);
            for ((w, &m), &v) in data.iter_mut().zip(m.iter()).zip(v.iter()) {
                let m_hat = m / bias_1;
                let v_hat = v / bias_2;
                *w -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
            }
            if self.decoupled && self.weight_decay > 0.0 {
                // Decoupled decay runs after the Adam step.
                let factor = 1.0 - self.learning_rate * self.weight_decay;
                for w in data.iter_mut() {
                    *w *= factor;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptimizerConfig;

    fn params_with(name: &str, data: Vec<f32>, grad: Vec<f32>) -> ParameterSet {
        let n = data.len();
        let mut params = ParameterSet::new();
        params
            .register(name, Tensor::from_data(data, &[n]).unwrap())
            .unwrap();
        params.get_mut(name).unwrap().grad = Some(grad);
        params
    }

    fn sgd_config(lr: f32, momentum: f32, nesterov: bool) -> OptimizerConfig {
        OptimizerConfig {
            optimizer_type: OptimizerType::Sgd,
            learning_rate: lr,
            momentum,
            nesterov,
            ..OptimizerConfig::default()
        }
    }

    #[test]
    fn sgd_single_scalar_step() {
        let mut params = params_with("w", vec![1.0], vec![0.5]);
        let mut opt = Optimizer::from_config(&sgd_config(0.1, 0.0, false)).unwrap();
        opt.step(&mut params);
        assert!((params.get("w").unwrap().data[0] - 0.95).abs() < 1e-6);
        match opt.state_view(&params) {
            OptimizerState::Sgd { velocity } => {
                assert_eq!(velocity, vec![("w".to_string(), vec![0.5])]);
            }
            _ => panic!("wrong state variant"),
        }
    }

    #[test]
    fn nesterov_uses_lookahead_gradient() {
        let mut params = params_with("w", vec![1.0], vec![0.5]);
        let mut opt = Optimizer::from_config(&sgd_config(0.1, 0.9, true)).unwrap();
        opt.step(&mut params);
        // v = 0.5; update = lr * (g + mu * v) = 0.1 * (0.5 + 0.45).
        assert!((params.get("w").unwrap().data[0] - (1.0 - 0.095)).abs() < 1e-6);
    }

    #[test]
    fn adam_first_step_matches_closed_form() {
        let mut params = params_with("w", vec![1.0], vec![1.0]);
        let cfg = OptimizerConfig {
            optimizer_type: OptimizerType::Adam,
            learning_rate: 0.01,
            weight_decay: 0.0,
            ..OptimizerConfig::default()
        };
        let mut opt = Optimizer::from_config(&cfg).unwrap();
        opt.step(&mut params);
        // m = 0.1, v = 0.001, m_hat = v_hat = 1: w = 1 - 0.01 / (1 + eps).
        let w = params.get("w").unwrap().data[0];
        assert!((w - 0.99).abs() < 1e-6);
        match opt.state_view(&params) {
            OptimizerState::Adam { step, m, v } => {
                assert_eq!(step, 1);
                assert!((m[0].1[0] - 0.1).abs() < 1e-6);
                assert!((v[0].1[0] - 0.001).abs() < 1e-7);
            }
            _ => panic!("wrong state variant"),
        }
    }

    #[test]
    fn adam_step_counter_increments_once_per_call() {
        let mut params = params_with("a", vec![1.0], vec![1.0]);
        params.register("b", Tensor::zeros(&[3])).unwrap();
        params.get_mut("b").unwrap().grad = Some(vec![1.0, 1.0, 1.0]);
        let cfg = OptimizerConfig {
            optimizer_type: OptimizerType::Adam,
            weight_decay: 0.0,
            ..OptimizerConfig::default()
        };
        let mut opt = Optimizer::from_config(&cfg).unwrap();
        for _ in 0..5 {
            opt.step(&mut params);
        }
        match opt.state_view(&params) {
            OptimizerState::Adam { step, .. } => assert_eq!(step, 5),
            _ => panic!("wrong state variant"),
        }
    }

    #[test]
    fn adamw_applies_decoupled_decay_after_the_step() {
        let mut with_decay = params_with("w", vec![1.0], vec![1.0]);
        let mut without = params_with("w", vec![1.0], vec![1.0]);
        let base = OptimizerConfig {
            optimizer_type: OptimizerType::AdamW,
            learning_rate: 0.01,
            weight_decay: 0.0,
            ..OptimizerConfig::default()
        };
        let mut plain = Optimizer::from_config(&base).unwrap();
        let mut decayed = Optimizer::from_config(&OptimizerConfig {
            weight_decay: 0.1,
            ..base
        })
        .unwrap();
        plain.step(&mut without);
        decayed.step(&mut with_decay);
        let expected = without.get("w").unwrap().data[0] * (1.0 - 0.01 * 0.1);
        assert!((with_decay.get("w").unwrap().data[0] - expected).abs() < 1e-6);
    }

    #[test]
    fn unimplemented_optimizers_are_rejected() {
        for optimizer_type in [
            OptimizerType::Rmsprop,
            OptimizerType::Adagrad,
            OptimizerType::Lamb,
            OptimizerType::Sophia,
        ] {
            let cfg = OptimizerConfig {
                optimizer_type,
                ..OptimizerConfig::default()
            };
            assert!(matches!(
                Optimizer::from_config(&cfg),
                Err(TrainError::Config(_))
            ));
        }
    }

    #[test]
    fn state_view_round_trips_through_bincode() {
        let mut params = params_with("w", vec![1.0, 2.0], vec![0.1, 0.2]);
        let cfg = OptimizerConfig {
            optimizer_type: OptimizerType::AdamW,
            ..OptimizerConfig::default()
        };
        let mut opt = Optimizer::from_config(&cfg).unwrap();
        opt.step(&mut params);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("optimizer.state");
        let bytes = bincode::serialize(&opt.state_view(&params)).unwrap();
        std::fs::write(&path, bytes).unwrap();

        let restored: OptimizerState =
            bincode::deserialize(&std::fs::read(&path).unwrap()).unwrap();
        let mut fresh = Optimizer::from_config(&cfg).unwrap();
        fresh.load_state(restored, &params).unwrap();

        // Both optimizers must agree on the next update.
        let mut a = params.clone();
        let mut b = params.clone();
        opt.step(&mut a);
        fresh.step(&mut b);
        assert_eq!(a.get("w").unwrap().data, b.get("w").unwrap().data);
    }

    #[test]
    fn momentum_accumulates_velocity() {
        let mut params = params_with("w", vec![1.0], vec![1.0]);
        let mut opt = Optimizer::from_config(&sgd_config(0.1, 0.9, false)).unwrap();
        opt.step(&mut params);
        // Same gradient again: v = 0.9 * 1 + 1 = 1.9.
        params.get_mut("w").unwrap().grad = Some(vec![1.0]);
        opt.step(&mut params);
        let w = params.get("w").unwrap().data[0];
        assert!((w - (1.0 - 0.1 - 0.19)).abs() < 1e-6);
    }
}
