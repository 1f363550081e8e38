use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::core::error::{GateError, Result};
use crate::permission::{PrivilegedLauncher, ProcessHandle};

/// Launches the privileged tool with a configured command.
///
/// The command is expected to open its own window or terminal; stdin is not
/// shared with the child so the approval prompt keeps the console.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| GateError::Config("launch command is empty".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl PrivilegedLauncher for CommandLauncher {
    fn launch_visible(&self) -> Result<Box<dyn ProcessHandle>> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GateError::Launch(format!("{}: {e}", self.program)))?;

        info!(pid = child.id(), program = %self.program, "Launched privileged tool");
        Ok(Box::new(ChildHandle { child: Some(child) }))
    }
}

struct ChildHandle {
    child: Option<Child>,
}

impl ProcessHandle for ChildHandle {
    fn dispose(&mut self) {
        if let Some(mut child) = self.child.take() {
            match child.start_kill() {
                Ok(()) => debug!(pid = child.id(), "Stopped privileged tool"),
                Err(e) => debug!(error = %e, "Privileged tool already exited"),
            }
        }
    }
}

/// Used when no launch command is configured: the user runs the privileged
/// tool themselves.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualLauncher;

impl PrivilegedLauncher for ManualLauncher {
    fn launch_visible(&self) -> Result<Box<dyn ProcessHandle>> {
        debug!("No launch command configured, waiting for the user to start the tool");
        Ok(Box::new(NoProcess))
    }
}

struct NoProcess;

impl ProcessHandle for NoProcess {
    fn dispose(&mut self) {}
}
