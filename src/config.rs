use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::TrainError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    Sgd,
    Adam,
    #[serde(rename = "adamw")]
    AdamW,
    Rmsprop,
    Adagrad,
    Lamb,
    Sophia,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerType {
    Constant,
    Step,
    Exponential,
    Cosine,
    CosineWarmup,
    LinearWarmup,
    OneCycle,
    ReduceOnPlateau,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossType {
    CrossEntropy,
    Bce,
    Mse,
    Huber,
    Focal,
    Contrastive,
    Triplet,
    Ranking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruningStrategy {
    None,
    Magnitude,
    Random,
    StructuredChannel,
    StructuredHead,
    LotteryTicket,
    Movement,
    Sensitivity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PruningSchedule {
    OneShot,
    Gradual,
    Cubic,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    None,
    MaxNorm,
    UnitNorm,
    MinMax,
    NonNegative,
    Spectral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintAxis {
    Global,
    Row,
    Column,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_optimizer_type")]
    pub optimizer_type: OptimizerType,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f32,
    #[serde(default = "default_momentum")]
    pub momentum: f32,
    #[serde(default = "default_beta1")]
    pub beta1: f32,
    #[serde(default = "default_beta2")]
    pub beta2: f32,
    #[serde(default = "default_epsilon")]
    pub epsilon: f32,
    #[serde(default)]
    pub nesterov: bool,
}

fn default_optimizer_type() -> OptimizerType {
    OptimizerType::AdamW
}

fn default_learning_rate() -> f32 {
    1e-3
}

fn default_weight_decay() -> f32 {
    1e-2
}

fn default_momentum() -> f32 {
    0.9
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.999
}

fn default_epsilon() -> f32 {
    1e-8
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            optimizer_type: default_optimizer_type(),
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            momentum: default_momentum(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_epsilon(),
            nesterov: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_type")]
    pub scheduler_type: SchedulerType,
    #[serde(default = "default_warmup_epochs")]
    pub warmup_epochs: usize,
    #[serde(default = "default_step_size")]
    pub step_size: usize,
    /// Per-branch default when absent: 0.1 for step and plateau, 0.95 for
    /// exponential.
    #[serde(default)]
    pub gamma: Option<f32>,
    #[serde(default = "default_min_lr")]
    pub min_lr: f32,
    #[serde(default)]
    pub max_lr: Option<f32>,
    #[serde(default = "default_scheduler_patience")]
    pub patience: usize,
    #[serde(default = "default_t_max")]
    pub t_max: usize,
    #[serde(default = "default_min_delta")]
    pub min_delta: f32,
}

fn default_scheduler_type() -> SchedulerType {
    SchedulerType::CosineWarmup
}

fn default_warmup_epochs() -> usize {
    5
}

fn default_step_size() -> usize {
    30
}

fn default_min_lr() -> f32 {
    1e-6
}

fn default_scheduler_patience() -> usize {
    10
}

fn default_t_max() -> usize {
    100
}

fn default_min_delta() -> f32 {
    1e-4
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scheduler_type: default_scheduler_type(),
            warmup_epochs: default_warmup_epochs(),
            step_size: default_step_size(),
            gamma: None,
            min_lr: default_min_lr(),
            max_lr: None,
            patience: default_scheduler_patience(),
            t_max: default_t_max(),
            min_delta: default_min_delta(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossConfig {
    #[serde(default = "default_loss_type")]
    pub loss_type: LossType,
    #[serde(default = "default_label_smoothing")]
    pub label_smoothing: f32,
    #[serde(default = "default_focal_gamma")]
    pub focal_gamma: f32,
    /// Recognized for the contrastive family, which is not implemented.
    #[serde(default = "default_margin")]
    pub margin: f32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_loss_type() -> LossType {
    LossType::CrossEntropy
}

fn default_label_smoothing() -> f32 {
    0.1
}

fn default_focal_gamma() -> f32 {
    2.0
}

fn default_margin() -> f32 {
    1.0
}

fn default_temperature() -> f32 {
    1.0
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            loss_type: default_loss_type(),
            label_smoothing: default_label_smoothing(),
            focal_gamma: default_focal_gamma(),
            margin: default_margin(),
            temperature: default_temperature(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightConstraintConfig {
    #[serde(default = "default_constraint_kind")]
    pub constraint: ConstraintKind,
    #[serde(default = "default_max_norm")]
    pub max_norm: f32,
    #[serde(default = "default_constraint_axis")]
    pub axis: ConstraintAxis,
    #[serde(default = "default_min_value")]
    pub min_value: f32,
    #[serde(default = "default_max_value")]
    pub max_value: f32,
    #[serde(default = "default_power_iterations")]
    pub power_iterations: usize,
}

fn default_constraint_kind() -> ConstraintKind {
    ConstraintKind::None
}

fn default_max_norm() -> f32 {
    2.0
}

fn default_constraint_axis() -> ConstraintAxis {
    ConstraintAxis::Global
}

fn default_min_value() -> f32 {
    -1.0
}

fn default_max_value() -> f32 {
    1.0
}

fn default_power_iterations() -> usize {
    1
}

impl Default for WeightConstraintConfig {
    fn default() -> Self {
        Self {
            constraint: default_constraint_kind(),
            max_norm: default_max_norm(),
            axis: default_constraint_axis(),
            min_value: default_min_value(),
            max_value: default_max_value(),
            power_iterations: default_power_iterations(),
        }
    }
}

/// Per-group weight constraints, addressed to parameters by name prefix.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeightConstraintSet {
    #[serde(default)]
    pub attention: WeightConstraintConfig,
    #[serde(default)]
    pub fastgrnn: WeightConstraintConfig,
    #[serde(default)]
    pub output: WeightConstraintConfig,
}

impl WeightConstraintSet {
    /// The constraint record governing a parameter, chosen by name prefix.
    pub fn constraint_for(&self, name: &str) -> Option<&WeightConstraintConfig> {
        if name.starts_with("attention") {
            Some(&self.attention)
        } else if name.starts_with("fastgrnn") {
            Some(&self.fastgrnn)
        } else if name.starts_with("output") {
            Some(&self.output)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientConstraintConfig {
    #[serde(default = "default_clip_gradients")]
    pub clip_gradients: bool,
    #[serde(default = "default_clip_norm")]
    pub clip_norm: Option<f32>,
    #[serde(default)]
    pub clip_value: Option<f32>,
    #[serde(default)]
    pub enable_gradient_scaling: bool,
}

fn default_clip_gradients() -> bool {
    true
}

fn default_clip_norm() -> Option<f32> {
    Some(1.0)
}

impl Default for GradientConstraintConfig {
    fn default() -> Self {
        Self {
            clip_gradients: default_clip_gradients(),
            clip_norm: default_clip_norm(),
            clip_value: None,
            enable_gradient_scaling: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundedConfig {
    #[serde(default)]
    pub weight_constraints: WeightConstraintSet,
    #[serde(default)]
    pub gradient_constraints: GradientConstraintConfig,
    #[serde(default)]
    pub l1_regularization: f32,
    #[serde(default = "default_l2_regularization")]
    pub l2_regularization: f32,
    #[serde(default)]
    pub elastic_net_ratio: f32,
}

fn default_l2_regularization() -> f32 {
    1e-4
}

impl Default for BoundedConfig {
    fn default() -> Self {
        Self {
            weight_constraints: WeightConstraintSet::default(),
            gradient_constraints: GradientConstraintConfig::default(),
            l1_regularization: 0.0,
            l2_regularization: default_l2_regularization(),
            elastic_net_ratio: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruningConfig {
    #[serde(default = "default_pruning_strategy")]
    pub strategy: PruningStrategy,
    #[serde(default)]
    pub target_sparsity: f32,
    #[serde(default = "default_pruning_schedule")]
    pub schedule: PruningSchedule,
    #[serde(default = "default_start_epoch")]
    pub start_epoch: usize,
    #[serde(default = "default_end_epoch")]
    pub end_epoch: usize,
    #[serde(default = "default_frequency")]
    pub frequency: usize,
    #[serde(default)]
    pub layer_sparsity: HashMap<String, f32>,
    #[serde(default)]
    pub enable_rewinding: bool,
    #[serde(default)]
    pub rewind_epoch: Option<usize>,
}

fn default_pruning_strategy() -> PruningStrategy {
    PruningStrategy::None
}

fn default_pruning_schedule() -> PruningSchedule {
    PruningSchedule::Gradual
}

fn default_start_epoch() -> usize {
    10
}

fn default_end_epoch() -> usize {
    80
}

fn default_frequency() -> usize {
    5
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            strategy: default_pruning_strategy(),
            target_sparsity: 0.0,
            schedule: default_pruning_schedule(),
            start_epoch: default_start_epoch(),
            end_epoch: default_end_epoch(),
            frequency: default_frequency(),
            layer_sparsity: HashMap::new(),
            enable_rewinding: false,
            rewind_epoch: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyStoppingConfig {
    #[serde(default = "default_early_stopping_enabled")]
    pub enabled: bool,
    #[serde(default = "default_early_stopping_patience")]
    pub patience: usize,
    #[serde(default = "default_min_delta")]
    pub min_delta: f32,
    #[serde(default = "default_monitor_metric")]
    pub monitor_metric: String,
    #[serde(default)]
    pub mode_max: bool,
}

fn default_early_stopping_enabled() -> bool {
    true
}

fn default_early_stopping_patience() -> usize {
    10
}

fn default_monitor_metric() -> String {
    "val_loss".to_string()
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        Self {
            enabled: default_early_stopping_enabled(),
            patience: default_early_stopping_patience(),
            min_delta: default_min_delta(),
            monitor_metric: default_monitor_metric(),
            mode_max: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default)]
    pub mixed_precision: bool,
    #[serde(default = "default_gradient_accumulation")]
    pub gradient_accumulation: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub loss: LossConfig,
    #[serde(default)]
    pub bounded: BoundedConfig,
    #[serde(default)]
    pub pruning: PruningConfig,
    #[serde(default)]
    pub early_stopping: EarlyStoppingConfig,
}

fn default_epochs() -> usize {
    100
}

fn default_seed() -> u64 {
    42
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_gradient_accumulation() -> usize {
    1
}

fn default_batch_size() -> usize {
    32
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            seed: default_seed(),
            device: default_device(),
            mixed_precision: false,
            gradient_accumulation: default_gradient_accumulation(),
            batch_size: default_batch_size(),
            optimizer: OptimizerConfig::default(),
            scheduler: SchedulerConfig::default(),
            loss: LossConfig::default(),
            bounded: BoundedConfig::default(),
            pruning: PruningConfig::default(),
            early_stopping: EarlyStoppingConfig::default(),
        }
    }
}

impl TrainingConfig {
    /// Short smoke-test runs: few epochs, hot learning rate, no schedule,
    /// no pruning.
    pub fn fast() -> Self {
        Self {
            epochs: 20,
            optimizer: OptimizerConfig {
                learning_rate: 1e-2,
                ..OptimizerConfig::default()
            },
            scheduler: SchedulerConfig {
                scheduler_type: SchedulerType::Constant,
                warmup_epochs: 0,
                ..SchedulerConfig::default()
            },
            ..Self::default()
        }
    }

    /// Long deployment runs with cubic magnitude pruning to 50%.
    pub fn production() -> Self {
        Self {
            epochs: 200,
            mixed_precision: true,
            pruning: PruningConfig {
                strategy: PruningStrategy::Magnitude,
                target_sparsity: 0.5,
                schedule: PruningSchedule::Cubic,
                start_epoch: 20,
                end_epoch: 160,
                ..PruningConfig::default()
            },
            ..Self::default()
        }
    }

    /// Aggressive compression: lottery-ticket pruning to 90% with weight
    /// rewinding and an elastic-net penalty.
    pub fn compression() -> Self {
        Self {
            epochs: 150,
            pruning: PruningConfig {
                strategy: PruningStrategy::LotteryTicket,
                target_sparsity: 0.9,
                schedule: PruningSchedule::Cubic,
                start_epoch: 10,
                end_epoch: 120,
                enable_rewinding: true,
                ..PruningConfig::default()
            },
            bounded: BoundedConfig {
                l1_regularization: 1e-4,
                l2_regularization: 1e-4,
                elastic_net_ratio: 0.5,
                ..BoundedConfig::default()
            },
            ..Self::default()
        }
    }

    /// Reject structurally invalid configurations and every enum variant
    /// that is recognized but not implemented. Silent fallthrough to a
    /// different optimizer or loss is never acceptable.
    pub fn validate(&self) -> Result<(), TrainError> {
        if self.device != "cpu" {
            return Err(TrainError::Config(format!(
                "device {:?} is not supported",
                self.device
            )));
        }
        if self.batch_size == 0 {
            return Err(TrainError::Config("batch_size must be at least 1".into()));
        }
        if self.gradient_accumulation == 0 {
            return Err(TrainError::Config(
                "gradient_accumulation must be at least 1".into(),
            ));
        }
        if matches!(
            self.optimizer.optimizer_type,
            OptimizerType::Rmsprop | OptimizerType::Adagrad | OptimizerType::Lamb | OptimizerType::Sophia
        ) {
            return Err(TrainError::Config(format!(
                "optimizer type {:?} is not implemented",
                self.optimizer.optimizer_type
            )));
        }
        if matches!(
            self.loss.loss_type,
            LossType::Contrastive | LossType::Triplet | LossType::Ranking
        ) {
            return Err(TrainError::Config(format!(
                "loss type {:?} is not implemented",
                self.loss.loss_type
            )));
        }
        if matches!(
            self.pruning.strategy,
            PruningStrategy::StructuredChannel
                | PruningStrategy::StructuredHead
                | PruningStrategy::Sensitivity
        ) {
            return Err(TrainError::Config(format!(
                "pruning strategy {:?} is not implemented",
                self.pruning.strategy
            )));
        }
        if !(0.0..=1.0).contains(&self.pruning.target_sparsity) {
            return Err(TrainError::Config(
                "target_sparsity must lie in [0, 1]".into(),
            ));
        }
        if self.pruning.end_epoch < self.pruning.start_epoch {
            return Err(TrainError::Config(
                "pruning end_epoch precedes start_epoch".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.bounded.elastic_net_ratio) {
            return Err(TrainError::Config(
                "elastic_net_ratio must lie in [0, 1]".into(),
            ));
        }
        match self.early_stopping.monitor_metric.as_str() {
            "val_loss" | "train_loss" | "val_accuracy" | "train_accuracy" => Ok(()),
            other => Err(TrainError::Config(format!(
                "unknown early-stopping metric {other:?}"
            ))),
        }
    }
}
