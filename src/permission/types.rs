use std::fmt;

/// A real change of the cached flag. First population of the cache never
/// produces one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionEvent {
    pub from: bool,
    pub to: bool,
}

impl TransitionEvent {
    #[must_use]
    pub const fn between(previous: Option<bool>, current: bool) -> Option<Self> {
        match previous {
            Some(from) if from != current => Some(Self { from, to: current }),
            _ => None,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> TransitionKind {
        if self.to {
            TransitionKind::Granted
        } else {
            TransitionKind::Revoked
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionKind {
    Granted,
    Revoked,
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Granted => write!(f, "granted"),
            Self::Revoked => write!(f, "revoked"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordinatorState {
    Uninitialized,
    Checking,
    Granted,
    NotGranted,
    AwaitingApproval,
    Cancelled,
    GaveUp,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Checking => write!(f, "checking"),
            Self::Granted => write!(f, "granted"),
            Self::NotGranted => write!(f, "not granted"),
            Self::AwaitingApproval => write!(f, "awaiting approval"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::GaveUp => write!(f, "gave up"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Cancelled,
    Granted,
    GaveUp,
    /// Another session took over, or the coordinator was disposed.
    Superseded,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Granted => write!(f, "granted"),
            Self::GaveUp => write!(f, "gave up"),
            Self::Superseded => write!(f, "superseded"),
        }
    }
}

/// Progress of one approval loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalSession {
    pub attempts: u32,
    pub status: SessionStatus,
}

impl ApprovalSession {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            attempts: 0,
            status: SessionStatus::Active,
        }
    }

    pub const fn begin_attempt(&mut self) {
        self.attempts += 1;
        self.status = SessionStatus::Active;
    }

    pub const fn finish(&mut self, status: SessionStatus) {
        self.status = status;
    }
}

impl Default for ApprovalSession {
    fn default() -> Self {
        Self::new()
    }
}

/// What the user wants after an approval attempt did not end in a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryChoice {
    Retry,
    Abandon,
    /// Abandon and stop offering the privileged mode at all.
    OptOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalStatus {
    Verifying,
    Failed,
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Verifying => write!(f, "Verifying permission..."),
            Self::Failed => write!(f, "Permission could not be saved"),
        }
    }
}

/// Notifications for consumers of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorEvent {
    PermissionGranted,
    PermissionRevoked,
    OptedOut,
}
