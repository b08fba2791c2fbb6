//! Business logic layered over `shepherd-k8s`: credential issuance, the
//! outbound callback sender, the in-memory event hub, the reconciliation
//! controller, and the status watcher.

pub mod callback;
pub mod context;
pub mod credential;
pub mod error;
pub mod events;
pub mod reconcile;
pub mod watcher;

pub use callback::{CallbackDetails, CallbackPayload, CallbackSender};
pub use context::{compress_context, decompress_context, ContextError};
pub use credential::{AppCredentials, IssueTokenOutcome, IssuedToken};
pub use error::{CallbackError, ReconcileError, TokenError};
pub use events::{Event, EventHub, EventType, HubMessage, Subscription, TaskOutcome};
pub use reconcile::{error_policy, reconcile, ReconcilerContext};
pub use watcher::Watcher;
