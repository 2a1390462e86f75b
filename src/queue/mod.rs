mod outbox;
mod pending;

pub use outbox::{EmailTask, Outbox};
pub use pending::{PendingChange, PendingQueue};
