use std::f32::consts::PI;

use crate::config::{SchedulerConfig, SchedulerType};

const ONE_CYCLE_RAMP: f32 = 0.3;

/// Per-epoch learning-rate schedule with linear warmup.
///
/// Warmup ramps from `base_lr / warmup_epochs` to `base_lr`; every other
/// branch floors its output at `min_lr`. Plateau bookkeeping lives here, not
/// in the trainer.
#[derive(Debug)]
pub struct LrScheduler {
    config: SchedulerConfig,
    base_lr: f32,
    current_lr: f32,
    best_metric: f32,
    bad_epochs: usize,
}

impl LrScheduler {
    pub fn new(base_lr: f32, config: &SchedulerConfig) -> Self {
        Self {
            config: config.clone(),
            base_lr,
            current_lr: base_lr,
            best_metric: f32::INFINITY,
            bad_epochs: 0,
        }
    }

    pub fn current_lr(&self) -> f32 {
        self.current_lr
    }

    pub fn step(&mut self, epoch: usize, metric: Option<f32>) -> f32 {
        let cfg = &self.config;
        if epoch < cfg.warmup_epochs {
            self.current_lr = self.base_lr * (epoch + 1) as f32 / cfg.warmup_epochs as f32;
            return self.current_lr;
        }
        let e = epoch - cfg.warmup_epochs;
        let t_max = cfg.t_max.max(1) as f32;

        self.current_lr = match cfg.scheduler_type {
            SchedulerType::Constant => self.base_lr,
            SchedulerType::Step => {
                let gamma = cfg.gamma.unwrap_or(0.1);
                self.base_lr * gamma.powi((e / cfg.step_size.max(1)) as i32)
            }
            SchedulerType::Exponential => {
                let gamma = cfg.gamma.unwrap_or(0.95);
                self.base_lr * gamma.powi(e as i32)
            }
            SchedulerType::Cosine | SchedulerType::CosineWarmup => {
                let p = e as f32 / t_max;
                cfg.min_lr + (self.base_lr - cfg.min_lr) * (1.0 + (PI * p).cos()) / 2.0
            }
            SchedulerType::LinearWarmup => {
                (self.base_lr * (1.0 - e as f32 / t_max)).max(cfg.min_lr)
            }
            SchedulerType::OneCycle => {
                let max_lr = cfg.max_lr.unwrap_or(10.0 * self.base_lr);
                let p = e as f32 / t_max;
                if p < ONE_CYCLE_RAMP {
                    self.base_lr + (max_lr - self.base_lr) * (p / ONE_CYCLE_RAMP)
                } else {
                    max_lr - (max_lr - cfg.min_lr) * ((p - ONE_CYCLE_RAMP) / (1.0 - ONE_CYCLE_RAMP))
                }
            }
            SchedulerType::ReduceOnPlateau => {
                if let Some(metric) = metric {
                    if metric < self.best_metric - cfg.min_delta {
                        self.best_metric = metric;
                        self.bad_epochs = 0;
                    } else {
                        self.bad_epochs += 1;
                    }
                    if self.bad_epochs >= cfg.patience {
                        let gamma = cfg.gamma.unwrap_or(0.1);
                        self.current_lr = (self.current_lr * gamma).max(cfg.min_lr);
                        self.bad_epochs = 0;
                    }
                }
                self.current_lr
            }
        };
        self.current_lr = self.current_lr.max(cfg.min_lr);
        self.current_lr
    }
}
