use async_trait::async_trait;
use parking_lot::Mutex;
use std::io::BufRead;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::error::{GateError, Result};
use crate::permission::{
    ApprovalResponder, ApprovalStatus, ApprovalUI, RetryChoice, RetryPrompter,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Accept,
    Cancel,
    Unrecognized,
    Empty,
}

#[must_use]
pub fn parse_answer(line: &str) -> Answer {
    match line.trim().to_ascii_lowercase().as_str() {
        "" => Answer::Empty,
        "y" | "yes" | "accept" => Answer::Accept,
        "n" | "no" | "cancel" => Answer::Cancel,
        _ => Answer::Unrecognized,
    }
}

#[must_use]
pub fn parse_retry_choice(line: &str) -> Option<RetryChoice> {
    match line.trim().to_ascii_lowercase().as_str() {
        "r" | "retry" => Some(RetryChoice::Retry),
        "a" | "abandon" => Some(RetryChoice::Abandon),
        "o" | "opt-out" | "optout" => Some(RetryChoice::OptOut),
        _ => None,
    }
}

/// Lines from stdin, read on a dedicated thread that is started on first use.
///
/// The thread is not runtime-managed, so a pending read never blocks shutdown.
#[derive(Default)]
pub struct ConsoleInput {
    lines: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl ConsoleInput {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Next line of input, or `None` once stdin is closed.
    pub async fn next_line(&self) -> Option<String> {
        let mut lines = self.lines.lock().await;
        let receiver = lines.get_or_insert_with(spawn_stdin_reader);
        receiver.recv().await
    }
}

fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    let spawned = std::thread::Builder::new()
        .name("privgate-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "Failed to start stdin reader");
    }
    rx
}

pub struct ConsoleApprovalUI {
    input: Arc<ConsoleInput>,
    flag_location: String,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ConsoleApprovalUI {
    #[must_use]
    pub fn new(input: Arc<ConsoleInput>, flag_location: impl Into<String>) -> Self {
        Self {
            input,
            flag_location: flag_location.into(),
            reader: Mutex::new(None),
        }
    }
}

impl ApprovalUI for ConsoleApprovalUI {
    fn show(&self, responder: ApprovalResponder) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| GateError::UiUnavailable(e.to_string()))?;

        eprintln!();
        eprintln!("Privileged mode needs your approval.");
        eprintln!(
            "Accept the privileged tool's prompt, or set the flag in {} yourself.",
            self.flag_location
        );
        eprintln!("Type 'yes' to grant permission here, 'no' to cancel.");

        let input = Arc::clone(&self.input);
        let task = runtime.spawn(async move {
            loop {
                let Some(line) = input.next_line().await else {
                    responder.dismiss();
                    return;
                };
                match parse_answer(&line) {
                    Answer::Accept => {
                        if responder.accept().await {
                            return;
                        }
                    }
                    Answer::Cancel => {
                        responder.cancel();
                        return;
                    }
                    Answer::Unrecognized => eprintln!("Please type 'yes' or 'no'."),
                    Answer::Empty => {}
                }
            }
        });

        let previous = self.reader.lock().replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    fn set_status(&self, status: ApprovalStatus) {
        eprintln!("{status}");
    }

    fn close(&self) {
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            reader.abort();
        }
    }
}

pub struct ConsolePrompter {
    input: Arc<ConsoleInput>,
}

impl ConsolePrompter {
    #[must_use]
    pub const fn new(input: Arc<ConsoleInput>) -> Self {
        Self { input }
    }
}

#[async_trait]
impl RetryPrompter for ConsolePrompter {
    async fn choose(&self, attempts: u32) -> RetryChoice {
        eprintln!(
            "Privileged mode was not approved (attempt {attempts}). [r]etry, [a]bandon, or [o]pt out?"
        );
        loop {
            let Some(line) = self.input.next_line().await else {
                return RetryChoice::Abandon;
            };
            if let Some(choice) = parse_retry_choice(&line) {
                return choice;
            }
            eprintln!("Please type 'r', 'a' or 'o'.");
        }
    }

    fn warn(&self, message: &str) {
        eprintln!("Warning: {message}");
    }
}
