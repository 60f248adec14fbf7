use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{Datelike, Timelike};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

use crate::config::TrainingConfig;
use crate::constraints::{
    apply_gradient_constraints, apply_regularization, apply_weight_constraint, global_grad_norm,
    GradScaler, DEFAULT_LOSS_SCALE,
};
use crate::loss::compute_loss;
use crate::optim::Optimizer;
use crate::prune::PruningManager;
use crate::schedule::LrScheduler;
use crate::tensor::{ParameterSet, Tensor};
use crate::TrainError;

/// One labeled routing sample: both tensors are 1-D with length equal to the
/// number of routing candidates.
#[derive(Debug, Clone)]
pub struct Sample {
    pub input: Tensor,
    pub target: Tensor,
}

/// The model is an external collaborator: the engine owns the update rule,
/// the model owns forward and gradient attribution. `backward` receives the
/// loss gradient with respect to the predictions and accumulates into the
/// parameter gradient buffers.
pub trait Model: Sync {
    fn forward(&self, params: &ParameterSet, input: &Tensor) -> Vec<f32>;
    fn backward(&self, params: &mut ParameterSet, input: &Tensor, grad_output: &[f32]);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f32,
    pub val_loss: Option<f32>,
    pub train_accuracy: f32,
    pub val_accuracy: Option<f32>,
    pub learning_rate: f32,
    pub gradient_norm: f32,
    pub sparsity: f32,
    pub epoch_time_ms: f64,
}

/// Drives one epoch at a time over an exclusively owned parameter set:
/// batch loop, gradient pipeline, optimizer step, constraint projection,
/// then the per-epoch scheduler and pruning passes.
pub struct Trainer {
    config: TrainingConfig,
    params: ParameterSet,
    optimizer: Optimizer,
    scheduler: LrScheduler,
    pruning: PruningManager,
    scaler: Option<GradScaler>,
    history: Vec<EpochMetrics>,
    best_metric: f32,
    bad_epochs: usize,
    numeric_warnings: usize,
    cancel: Arc<AtomicBool>,
}

impl Trainer {
    pub fn new(config: TrainingConfig, params: ParameterSet) -> Result<Self, TrainError> {
        config.validate()?;
        let optimizer = Optimizer::from_config(&config.optimizer)?;
        let scheduler = LrScheduler::new(config.optimizer.learning_rate, &config.scheduler);
        let mut pruning = PruningManager::new(&config.pruning, config.seed)?;
        for (name, tensor) in params.iter() {
            pruning.register(name, tensor);
        }
        let scaler = (config.mixed_precision
            || config.bounded.gradient_constraints.enable_gradient_scaling)
            .then(|| GradScaler::new(DEFAULT_LOSS_SCALE));
        let best_metric = if config.early_stopping.mode_max {
            f32::NEG_INFINITY
        } else {
            f32::INFINITY
        };
        Ok(Self {
            config,
            params,
            optimizer,
            scheduler,
            pruning,
            scaler,
            history: Vec::new(),
            best_metric,
            bad_epochs: 0,
            numeric_warnings: 0,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn params(&self) -> &ParameterSet {
        &self.params
    }

    pub fn into_params(self) -> ParameterSet {
        self.params
    }

    pub fn history(&self) -> &[EpochMetrics] {
        &self.history
    }

    pub fn pruning(&self) -> &PruningManager {
        &self.pruning
    }

    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }

    pub fn numeric_warnings(&self) -> usize {
        self.numeric_warnings
    }

    /// Handle for cooperative cancellation. A cancel observed at a batch
    /// boundary ends the epoch and discards its partial metrics record;
    /// parameters keep any updates already applied.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn should_stop(&self) -> bool {
        self.config.early_stopping.enabled && self.bad_epochs >= self.config.early_stopping.patience
    }

    /// Run one epoch. Returns `Ok(None)` when cancelled between batches.
    pub fn train_epoch<M: Model>(
        &mut self,
        epoch: usize,
        model: &M,
        train: &[Sample],
        val: Option<&[Sample]>,
    ) -> Result<Option<EpochMetrics>, TrainError> {
        let started = Instant::now();
        let accumulation = self.config.gradient_accumulation.max(1);
        let batch_count = train.chunks(self.config.batch_size).count();

        let mut loss_sum = 0.0f64;
        let mut correct = 0usize;
        let mut seen = 0usize;

        for (batch_index, batch) in train.chunks(self.config.batch_size).enumerate() {
            if self.cancel.load(Ordering::Relaxed) {
                return Ok(None);
            }
            if batch_index % accumulation == 0 {
                self.optimizer.zero_grad(&mut self.params);
            }
            for sample in batch {
                let predictions = model.forward(&self.params, &sample.input);
                let (loss, mut grad) =
                    compute_loss(&predictions, &sample.target.data, &self.config.loss)?;
                if let Some(scaler) = &self.scaler {
                    scaler.scale(&mut grad);
                }
                model.backward(&mut self.params, &sample.input, &grad);
                loss_sum += loss as f64;
                seen += 1;
                if argmax(&predictions) == argmax(&sample.target.data) {
                    correct += 1;
                }
            }
            let window_ends = (batch_index + 1) % accumulation == 0 || batch_index + 1 == batch_count;
            if window_ends {
                // Atomic with respect to parameter state: clip, regularize,
                // step, project. No suspension point may split this.
                if let Some(scaler) = &self.scaler {
                    scaler.unscale(&mut self.params);
                }
                apply_gradient_constraints(
                    &mut self.params,
                    &self.config.bounded.gradient_constraints,
                );
                apply_regularization(&mut self.params, &self.config.bounded);
                self.optimizer.step(&mut self.params);
                for (name, tensor) in self.params.iter_mut() {
                    if let Some(cfg) = self.config.bounded.weight_constraints.constraint_for(name) {
                        apply_weight_constraint(tensor, cfg)?;
                    }
                }
                self.check_finite();
            }
        }

        let train_loss = if seen > 0 {
            (loss_sum / seen as f64) as f32
        } else {
            0.0
        };
        let train_accuracy = if seen > 0 {
            correct as f32 / seen as f32
        } else {
            0.0
        };

        let (val_loss, val_accuracy) = match val {
            Some(val) => {
                let (loss, accuracy) = self.evaluate(model, val)?;
                (Some(loss), Some(accuracy))
            }
            None => (None, None),
        };

        let learning_rate = self.scheduler.step(epoch, val_loss);
        self.optimizer.set_lr(learning_rate);

        self.pruning.maybe_snapshot(epoch, &self.params);
        if self.pruning.should_prune(epoch) {
            for (name, tensor) in self.params.iter_mut() {
                self.pruning.prune(name, tensor, epoch);
            }
        }
        let sparsity = self.pruning.aggregate_sparsity();
        let gradient_norm = global_grad_norm(&self.params);

        let metrics = EpochMetrics {
            epoch,
            train_loss,
            val_loss,
            train_accuracy,
            val_accuracy,
            learning_rate,
            gradient_norm,
            sparsity,
            epoch_time_ms: started.elapsed().as_secs_f64() * 1e3,
        };
        self.history.push(metrics.clone());
        self.update_early_stopping(&metrics);
        Ok(Some(metrics))
    }

    /// Forward-only pass over a dataset; never touches the optimizer,
    /// constraints or regularizer.
    pub fn evaluate<M: Model>(&self, model: &M, samples: &[Sample]) -> Result<(f32, f32), TrainError> {
        if samples.is_empty() {
            return Ok((0.0, 0.0));
        }
        let results: Vec<(f32, bool)> = samples
            .par_iter()
            .map(|sample| -> Result<(f32, bool), TrainError> {
                let predictions = model.forward(&self.params, &sample.input);
                let (loss, _) = compute_loss(&predictions, &sample.target.data, &self.config.loss)?;
                Ok((loss, argmax(&predictions) == argmax(&sample.target.data)))
            })
            .collect::<Result<_, TrainError>>()?;
        let loss = results.iter().map(|(l, _)| *l as f64).sum::<f64>() / results.len() as f64;
        let accuracy =
            results.iter().filter(|(_, hit)| *hit).count() as f32 / results.len() as f32;
        Ok((loss as f32, accuracy))
    }

    fn update_early_stopping(&mut self, metrics: &EpochMetrics) {
        let cfg = &self.config.early_stopping;
        let monitored = match cfg.monitor_metric.as_str() {
            "train_loss" => Some(metrics.train_loss),
            "train_accuracy" => Some(metrics.train_accuracy),
            "val_accuracy" => metrics.val_accuracy,
            _ => metrics.val_loss,
        };
        let Some(monitored) = monitored else { return };
        let improved = if cfg.mode_max {
            monitored > self.best_metric + cfg.min_delta
        } else {
            monitored < self.best_metric - cfg.min_delta
        };
        if improved {
            self.best_metric = monitored;
            self.bad_epochs = 0;
        } else {
            self.bad_epochs += 1;
        }
    }

    /// Non-finite values do not halt training; they are surfaced through the
    /// warning counter and the log.
    fn check_finite(&mut self) {
        for (name, tensor) in self.params.iter() {
            let data_bad = tensor.data.iter().any(|x| !x.is_finite());
            let grad_bad = tensor
                .grad
                .as_ref()
                .is_some_and(|g| g.iter().any(|x| !x.is_finite()));
            if data_bad || grad_bad {
                self.numeric_warnings += 1;
                log::warn!("non-finite values in {name} after update");
            }
        }
    }

    /// Full training run: a timestamped run directory receives the
    /// experiment log, the resolved config and the metrics history.
    pub fn fit<M: Model>(
        &mut self,
        model: &M,
        train: &[Sample],
        val: Option<&[Sample]>,
        artifact_root: &str,
    ) -> Result<PathBuf, TrainError> {
        let run_dir = Path::new(artifact_root).join(run_dir_name());
        std::fs::create_dir_all(&run_dir).expect("artifact dir should be creatable");
        crate::init_logging();
        crate::set_log_file(&run_dir.join("experiment.log"));

        let config_json =
            serde_json::to_string_pretty(&self.config).expect("config should serialize");
        std::fs::write(run_dir.join("config.json"), config_json)
            .expect("config.json should be writable");

        for epoch in 0..self.config.epochs {
            match self.train_epoch(epoch, model, train, val)? {
                Some(metrics) => {
                    log::info!(
                        "epoch {} loss {:.5} acc {:.3} val_loss {} lr {:.2e} sparsity {:.3}",
                        metrics.epoch,
                        metrics.train_loss,
                        metrics.train_accuracy,
                        metrics
                            .val_loss
                            .map(|l| format!("{l:.5}"))
                            .unwrap_or_else(|| "-".to_string()),
                        metrics.learning_rate,
                        metrics.sparsity,
                    );
                }
                None => {
                    log::warn!("training cancelled at epoch {epoch}");
                    break;
                }
            }
            if self.should_stop() {
                log::info!("early stopping after epoch {epoch}");
                break;
            }
        }

        let history_json =
            serde_json::to_string_pretty(&self.history).expect("history should serialize");
        std::fs::write(run_dir.join("history.json"), history_json)
            .expect("history.json should be writable");
        Ok(run_dir)
    }
}

fn run_dir_name() -> String {
    let datetime = chrono::Local::now();
    format!(
        "{}-{:0>2}-{:0>2}={:0>2}-{:0>2}-{:0>2}",
        datetime.year(),
        datetime.month(),
        datetime.day(),
        datetime.hour(),
        datetime.minute(),
        datetime.second()
    )
}

fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}
