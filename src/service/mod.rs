//! The client-facing surface: signal fan-out, diffing and the command
//! facade.

pub mod agent_service;
pub mod diff;
pub mod signals;

pub use agent_service::{AgentError, AgentService, FilterCriteria, TreeAction, TreeUiState};
pub use diff::{ChangeMaker, DiffEntry, DiffResult};
pub use signals::{SignalHub, Subscription};
