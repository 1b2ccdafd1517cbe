mod handle;
mod invocation;
mod lines;

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use protocol::ProbeCommand;

use crate::validate::is_valid_target;

pub(crate) use handle::ProbeHandle;
pub(crate) use invocation::{build_invocation, Invocation, Platform};
pub(crate) use lines::DEFAULT_LINE_BUFFER;

/// Why a request never produced a running probe. Every variant is reported
/// to the client the same way; the distinction only matters for logs.
#[derive(Debug)]
pub(crate) enum ProbeError {
    UnknownCommand(String),
    InvalidTarget {
        command: ProbeCommand,
        target: String,
    },
    Spawn {
        program: String,
        source: io::Error,
    },
}

impl ProbeError {
    pub(crate) fn event(&self) -> &'static str {
        match self {
            ProbeError::UnknownCommand(_) => "probe.unknown_command",
            ProbeError::InvalidTarget { .. } => "probe.invalid_target",
            ProbeError::Spawn { .. } => "probe.spawn_failed",
        }
    }
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeError::UnknownCommand(command) => write!(f, "unknown command {command}"),
            ProbeError::InvalidTarget { command, target } => {
                write!(f, "target {target:?} not allowed for {command}")
            }
            ProbeError::Spawn { program, source } => write!(f, "failed to spawn {program}: {source}"),
        }
    }
}

impl std::error::Error for ProbeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProbeError::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Turns a validated command and target into exactly one running process.
#[derive(Debug, Clone)]
pub(crate) struct ProbeExecutor {
    platform: Platform,
    line_buffer: usize,
    programs: Arc<BTreeMap<String, String>>,
}

impl ProbeExecutor {
    pub(crate) fn new(line_buffer: usize) -> Self {
        Self {
            platform: Platform::current(),
            line_buffer,
            programs: Arc::default(),
        }
    }

    /// Runs tools from the given paths instead of looking them up on PATH.
    pub(crate) fn with_programs(mut self, programs: BTreeMap<String, String>) -> Self {
        self.programs = Arc::new(programs);
        self
    }

    /// Validation happens before anything touches the OS; a rejected target
    /// never spawns a process.
    pub(crate) fn plan(&self, command: &str, target: &str) -> Result<Invocation, ProbeError> {
        let command: ProbeCommand = command
            .parse()
            .map_err(|err: protocol::UnknownCommand| ProbeError::UnknownCommand(err.0))?;
        if !is_valid_target(command, target) {
            return Err(ProbeError::InvalidTarget {
                command,
                target: target.to_string(),
            });
        }
        let mut invocation = build_invocation(self.platform, command, target);
        if let Some(path) = self.programs.get(&invocation.program) {
            invocation.program = path.clone();
        }
        Ok(invocation)
    }

    pub(crate) fn execute(&self, command: &str, target: &str) -> Result<ProbeHandle, ProbeError> {
        let invocation = self.plan(command, target)?;
        self.launch(&invocation)
    }

    pub(crate) fn launch(&self, invocation: &Invocation) -> Result<ProbeHandle, ProbeError> {
        let handle =
            ProbeHandle::spawn(invocation, self.line_buffer).map_err(|source| ProbeError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;
        tracing::info!(
            event = "probe.spawned",
            program = %invocation.program,
            args = ?invocation.args,
            pid = ?handle.pid(),
        );
        Ok(handle)
    }
}
