//! Terminal collaborators used by the `privgate` binary.

pub mod console;
pub mod launcher;

pub use console::{ConsoleApprovalUI, ConsoleInput, ConsolePrompter};
pub use launcher::{CommandLauncher, ManualLauncher};
