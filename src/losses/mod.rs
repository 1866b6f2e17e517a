/// Self-supervised objectives
///
/// Each loss takes projections (or prototype scores) of several views of the
/// same batch. Losses that need negatives or batch statistics from every
/// replica take a [`ProcessGroup`](crate::utils::ProcessGroup).

pub mod barlow;
pub mod byol;
pub mod dino;
pub mod mocov2plus;
pub mod simclr;
pub mod swav;
pub mod vicreg;
pub mod wmse;

pub use barlow::barlow_loss_func;
pub use byol::byol_loss_func;
pub use dino::{DinoLoss, DinoLossConfig};
pub use mocov2plus::mocov2plus_loss_func;
pub use simclr::simclr_loss_func;
pub use swav::swav_loss_func;
pub use vicreg::vicreg_loss_func;
pub use wmse::wmse_loss_func;
