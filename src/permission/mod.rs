pub mod cache;
pub mod coordinator;
pub mod types;
pub mod ui_trait;

pub use cache::{PermissionCache, SubscriptionId, TransitionHandler};
pub use coordinator::PermissionCoordinator;
pub use types::{
    ApprovalSession, ApprovalStatus, CoordinatorEvent, CoordinatorState, RetryChoice,
    SessionStatus, TransitionEvent, TransitionKind,
};
pub use ui_trait::{ApprovalResponder, ApprovalUI, PrivilegedLauncher, ProcessHandle, RetryPrompter};

#[cfg(test)]
pub use ui_trait::test_utils;
