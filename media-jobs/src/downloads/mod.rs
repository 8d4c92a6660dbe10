//! Download-oriented view over the worker pool: identities, batches and
//! aggregated status.

mod command;
mod coordinator;
mod models;
mod work;

pub use command::CommandWork;
pub use coordinator::{BatchCoordinator, CoordinatorConfig};
pub use models::{
    BatchCounts, BatchRecord, BatchSnapshot, BatchState, DownloadRecord, DownloadSnapshot,
    DownloadStatus, Options,
};
pub use work::DownloadWork;
