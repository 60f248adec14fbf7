use std::collections::HashMap;

use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::config::{PruningConfig, PruningSchedule, PruningStrategy};
use crate::tensor::{ParameterSet, Tensor};
use crate::TrainError;

/// Per-parameter binary masks plus the progressive sparsity schedule.
///
/// Masks are f32 in `{0, 1}` so application is a fused multiply over the
/// data buffer. Once a position is zeroed it stays zeroed; only the
/// lottery-ticket rewind touches data afterwards, and it never touches the
/// mask. Names not seen before are lazily registered with an all-ones mask.
#[derive(Debug)]
pub struct PruningManager {
    config: PruningConfig,
    masks: HashMap<String, Vec<f32>>,
    snapshots: HashMap<String, Vec<f32>>,
    rng: SmallRng,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerSparsity {
    pub name: String,
    pub sparsity: f32,
    pub nnz: usize,
    pub total: usize,
}

impl PruningManager {
    pub fn new(config: &PruningConfig, seed: u64) -> Result<Self, TrainError> {
        match config.strategy {
            PruningStrategy::StructuredChannel
            | PruningStrategy::StructuredHead
            | PruningStrategy::Sensitivity => Err(TrainError::Config(format!(
                "pruning strategy {:?} is not implemented",
                config.strategy
            ))),
            _ => Ok(Self {
                config: config.clone(),
                masks: HashMap::new(),
                snapshots: HashMap::new(),
                rng: SmallRng::seed_from_u64(seed),
            }),
        }
    }

    pub fn register(&mut self, name: &str, tensor: &Tensor) {
        self.masks
            .entry(name.to_string())
            .or_insert_with(|| vec![1.0; tensor.numel()]);
        if self.config.strategy == PruningStrategy::LotteryTicket {
            self.snapshots
                .entry(name.to_string())
                .or_insert_with(|| tensor.data.clone());
        }
    }

    /// Re-capture the rewind snapshots when `rewind_epoch` is configured and
    /// reached. Without `rewind_epoch`, the registration-time weights stand.
    pub fn maybe_snapshot(&mut self, epoch: usize, params: &ParameterSet) {
        if self.config.strategy != PruningStrategy::LotteryTicket {
            return;
        }
        if self.config.rewind_epoch == Some(epoch) {
            for (name, tensor) in params.iter() {
                self.snapshots.insert(name.to_string(), tensor.data.clone());
            }
        }
    }

    /// Target sparsity at `epoch` under the configured schedule.
    pub fn target_sparsity(&self, epoch: usize) -> f32 {
        let cfg = &self.config;
        if epoch < cfg.start_epoch {
            return 0.0;
        }
        if epoch >= cfg.end_epoch || cfg.end_epoch <= cfg.start_epoch {
            return cfg.target_sparsity;
        }
        let p = (epoch - cfg.start_epoch) as f32 / (cfg.end_epoch - cfg.start_epoch) as f32;
        match cfg.schedule {
            PruningSchedule::OneShot => cfg.target_sparsity,
            PruningSchedule::Gradual => cfg.target_sparsity * p,
            PruningSchedule::Cubic => cfg.target_sparsity * (1.0 - (1.0 - p).powi(3)),
            PruningSchedule::Exponential => cfg.target_sparsity * (1.0 - (-3.0 * p).exp()),
        }
    }

    pub fn should_prune(&self, epoch: usize) -> bool {
        let cfg = &self.config;
        cfg.strategy != PruningStrategy::None
            && epoch >= cfg.start_epoch
            && epoch <= cfg.end_epoch
            && (epoch - cfg.start_epoch) % cfg.frequency.max(1) == 0
    }

    /// Prune one tensor toward the epoch's effective sparsity and re-apply
    /// its mask. Layer-specific sparsity overrides the schedule.
    pub fn prune(&mut self, name: &str, tensor: &mut Tensor, epoch: usize) {
        if self.config.strategy == PruningStrategy::None {
            return;
        }
        self.register(name, tensor);

        let s_eff = self
            .config
            .layer_sparsity
            .get(name)
            .copied()
            .unwrap_or_else(|| self.target_sparsity(epoch));
        let n = tensor.numel();
        let target_nnz = (n as f32 * (1.0 - s_eff)).round() as usize;

        let mask = self.masks.get_mut(name).expect("mask registered above");
        let live: Vec<usize> = (0..n).filter(|&i| mask[i] != 0.0).collect();
        if live.len() > target_nnz {
            let deficit = live.len() - target_nnz;
            let doomed = match self.config.strategy {
                PruningStrategy::Magnitude | PruningStrategy::LotteryTicket => {
                    lowest_by(&live, deficit, |i| tensor.data[i].abs())
                }
                PruningStrategy::Movement => match tensor.grad.as_ref() {
                    // Movement score: -w * g, most negative movement first.
                    Some(grad) => lowest_by(&live, deficit, |i| -tensor.data[i] * grad[i]),
                    None => lowest_by(&live, deficit, |i| tensor.data[i].abs()),
                },
                PruningStrategy::Random => {
                    let mut shuffled = live.clone();
                    shuffled.shuffle(&mut self.rng);
                    shuffled.truncate(deficit);
                    shuffled
                }
                _ => Vec::new(),
            };
            for i in doomed {
                mask[i] = 0.0;
            }
        }

        if self.config.strategy == PruningStrategy::LotteryTicket && self.config.enable_rewinding {
            if let Some(snapshot) = self.snapshots.get(name) {
                for i in 0..n {
                    if mask[i] != 0.0 {
                        tensor.data[i] = snapshot[i];
                    }
                }
            }
        }

        for (w, &m) in tensor.data.iter_mut().zip(mask.iter()) {
            *w *= m;
        }
    }

    /// Re-apply an existing mask without re-scoring.
    pub fn apply_mask(&self, name: &str, tensor: &mut Tensor) {
        if let Some(mask) = self.masks.get(name) {
            for (w, &m) in tensor.data.iter_mut().zip(mask.iter()) {
                *w *= m;
            }
        }
    }

    pub fn mask(&self, name: &str) -> Option<&[f32]> {
        self.masks.get(name).map(|m| m.as_slice())
    }

    pub fn layer_stats(&self) -> Vec<LayerSparsity> {
        let mut stats: Vec<LayerSparsity> = self
            .masks
            .iter()
            .map(|(name, mask)| {
                let nnz = mask.iter().filter(|&&m| m != 0.0).count();
                LayerSparsity {
                    name: name.clone(),
                    sparsity: 1.0 - nnz as f32 / mask.len().max(1) as f32,
                    nnz,
                    total: mask.len(),
                }
            })
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Aggregate sparsity: the element-weighted mean over all masks.
    pub fn aggregate_sparsity(&self) -> f32 {
        let total: usize = self.masks.values().map(|m| m.len()).sum();
        if total == 0 {
            return 0.0;
        }
        let zeros: usize = self
            .masks
            .values()
            .map(|m| m.iter().filter(|&&x| x == 0.0).count())
            .sum();
        zeros as f32 / total as f32
    }

    /// Serializable mask view for checkpointing alongside optimizer state.
    pub fn mask_view(&self) -> Vec<(String, Vec<f32>)> {
        let mut view: Vec<(String, Vec<f32>)> =
            self.masks.iter().map(|(n, m)| (n.clone(), m.clone())).collect();
        view.sort_by(|a, b| a.0.cmp(&b.0));
        view
    }
}

/// Indices of the `count` lowest-scoring live positions, ascending by score.
fn lowest_by(live: &[usize], count: usize, score: impl Fn(usize) -> f32) -> Vec<usize> {
    let mut scored: Vec<usize> = live.to_vec();
    scored.sort_by(|&a, &b| score(a).total_cmp(&score(b)));
    scored.truncate(count);
    scored
}
