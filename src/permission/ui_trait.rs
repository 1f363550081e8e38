use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::types::{ApprovalStatus, RetryChoice};
use crate::core::error::Result;

#[derive(Debug)]
pub(crate) enum SessionSignal {
    Accept(oneshot::Sender<bool>),
    Cancel,
    Dismiss,
    ExternalGrant,
    Terminated,
}

/// Handed to the approval UI when it is shown; the UI reports the user's
/// choice through it.
#[derive(Debug, Clone)]
pub struct ApprovalResponder {
    signals: mpsc::UnboundedSender<SessionSignal>,
}

impl ApprovalResponder {
    pub(crate) const fn new(signals: mpsc::UnboundedSender<SessionSignal>) -> Self {
        Self { signals }
    }

    /// Reports an explicit accept and waits for the permission to be saved.
    /// Returns `false` if saving failed or the session already ended.
    pub async fn accept(&self) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.signals.send(SessionSignal::Accept(reply_tx)).is_err() {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    pub fn cancel(&self) {
        let _ = self.signals.send(SessionSignal::Cancel);
    }

    /// The UI went away without the user choosing anything.
    pub fn dismiss(&self) {
        let _ = self.signals.send(SessionSignal::Dismiss);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.signals.is_closed()
    }
}

pub trait ApprovalUI: Send + Sync {
    fn show(&self, responder: ApprovalResponder) -> Result<()>;

    fn set_status(&self, status: ApprovalStatus);

    /// Must be idempotent and safe to call when nothing is shown.
    fn close(&self);
}

pub trait ProcessHandle: Send {
    fn dispose(&mut self);
}

pub trait PrivilegedLauncher: Send + Sync {
    /// Starts the privileged tool somewhere the user can see and interact
    /// with it.
    fn launch_visible(&self) -> Result<Box<dyn ProcessHandle>>;
}

#[async_trait]
pub trait RetryPrompter: Send + Sync {
    async fn choose(&self, attempts: u32) -> RetryChoice;

    fn warn(&self, message: &str);
}
