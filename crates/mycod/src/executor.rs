//! Executor implementations the daemon wires into the node.
//!
//! The core hands over every accepted record exactly once per accepted
//! version; what happens next is policy. `LogExecutor` only records the
//! fact, `CommandExecutor` drives an external toolchain binary. Failures
//! propagate back as errors, which the core logs and swallows — the record
//! stays accepted and keeps gossiping either way.

use std::process::Command;

use anyhow::{bail, Context, Result};
use myco_core::{Executor, ServiceRecord};

/// The executor type the daemon holds: picked from config at startup.
pub type BoxedExecutor = Box<dyn Executor<Error = anyhow::Error> + Send>;

/// Pick an executor for the configured toolchain command. Empty = log only.
pub fn from_command(command: &str) -> BoxedExecutor {
    if command.is_empty() {
        Box::new(LogExecutor)
    } else {
        Box::new(CommandExecutor::new(command))
    }
}

/// Logs every accepted record and does nothing else.
pub struct LogExecutor;

impl Executor for LogExecutor {
    type Error = anyhow::Error;

    fn deploy(&mut self, record: ServiceRecord) -> Result<()> {
        tracing::info!(
            id = record.service_id(),
            name = record.name_str(),
            flake = record.flake_uri_str(),
            "service accepted"
        );
        Ok(())
    }
}

/// Runs `<command> <flake_uri> <exec_name>` per accepted record and
/// requires a zero exit status.
pub struct CommandExecutor {
    program: String,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Executor for CommandExecutor {
    type Error = anyhow::Error;

    fn deploy(&mut self, record: ServiceRecord) -> Result<()> {
        tracing::info!(
            id = record.service_id(),
            name = record.name_str(),
            command = %self.program,
            "running toolchain"
        );
        let status = Command::new(self.program.as_str())
            .arg(record.flake_uri_str())
            .arg(record.exec_name_str())
            .status()
            .with_context(|| format!("spawning {}", self.program))?;
        if !status.success() {
            bail!("{} exited with {status}", self.program);
        }
        Ok(())
    }
}
