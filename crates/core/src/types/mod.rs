//! Entity and value types shared across AgentWarden components.

mod action;
mod agent;
mod approval;
mod event;
mod session;
mod trace;
mod violation;

pub use action::{ActionContext, ActionInfo, ActionType, AgentInfo, Effect, SessionInfo, Verdict};
pub use agent::{Agent, AgentStats, AgentVersion, AgentVersionStatus, SystemStats};
pub use approval::{Approval, ApprovalRequest, ApprovalStatus, TimeoutEffect};
pub use event::{
    ActionEvent, Alert, AlertSeverity, DetectionEvent, DetectionType, EnforcementAction,
};
pub use session::{Session, SessionFilter, SessionStatus};
pub use trace::{Trace, TraceFilter, TraceStatus};
pub use violation::Violation;
