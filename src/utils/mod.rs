/// Training-support utilities
///
/// - Checkpointer (run directories, args snapshot, safetensors checkpoints)
/// - Momentum updater for EMA target networks
/// - Cross-replica gather for contrastive losses
/// - Sinkhorn-Knopp cluster assignment
/// - Whitening (decorrelation) transform
/// - Truncated normal init and tensor helpers
/// - Accuracy metrics and weighted k-NN

pub mod checkpointer;
pub mod gather;
pub mod knn;
pub mod metrics;
pub mod misc;
pub mod momentum;
pub mod sinkhorn_knopp;
pub mod whitening;

pub use checkpointer::{Checkpoint, CheckpointConfig, CheckpointMetadata, Checkpointer, TrainingState};
pub use gather::{gather, GatherLayer, LocalProcessGroup, ProcessGroup, SingleProcess};
pub use knn::{Distance, WeightedKnnClassifier};
pub use metrics::{accuracy_at_k, weighted_mean};
pub use misc::{trunc_normal, trunc_normal_, TruncNormal};
pub use momentum::{initialize_momentum_params, MomentumUpdater};
pub use sinkhorn_knopp::SinkhornKnopp;
pub use whitening::Whitening2d;
