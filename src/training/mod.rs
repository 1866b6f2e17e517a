/// Training infrastructure
///
/// Momentum SGD and LARS, learning rate schedules, the pretraining loop and
/// frozen-feature evaluation.
pub mod lars;
pub mod linear;
pub mod optimizer;
pub mod scheduler;
pub mod trainer;

pub use lars::{Lars, LarsConfig};
pub use linear::{knn_evaluate, KnnConfig, LinearConfig, LinearEvalReport, LinearProbe};
pub use optimizer::{MomentumSgd, ParamsSgd, WeightDecay};
pub use scheduler::{LrScheduler, SchedulerConfig, SchedulerKind};
pub use trainer::{PretrainOptimizer, StepMetrics, Trainer};
