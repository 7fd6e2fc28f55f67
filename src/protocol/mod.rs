//! Wire-level vocabulary shared by both ends of the narrow channel.

pub mod callout;
pub mod envelope;
pub mod request;

/// Script-allocated request identifier.
pub type CorrelationId = String;

pub use callout::{CallOut, Notification, SnippetError};
pub use envelope::{Envelope, TransportError};
pub use request::{BudgetPolicy, EntryPoint, Family, Operation, Request, ValidationError};
