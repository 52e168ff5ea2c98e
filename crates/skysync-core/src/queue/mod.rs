pub mod drainer;
pub mod manager;
pub mod mutation;

pub use drainer::{DrainReport, QueueDrainer};
pub use manager::MutationQueue;
pub(crate) use manager::Settlement;
pub(crate) use mutation::AccountQueue;
pub use mutation::{Invalidation, MutationEvent, MutationStatus, QueuedMutation};
