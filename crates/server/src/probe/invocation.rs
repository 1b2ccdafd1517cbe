use protocol::ProbeCommand;

/// What to do with a probe's standard error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StderrMode {
    /// Any error output means the tool gave up; kill it.
    Kill,
    /// Error output is part of the diagnostic and is streamed as lines.
    Forward,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Invocation {
    pub(crate) program: String,
    pub(crate) args: Vec<String>,
    pub(crate) stderr: StderrMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Platform {
    Linux,
    MacOs,
}

impl Platform {
    pub(crate) fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }
}

pub(crate) fn build_invocation(platform: Platform, command: ProbeCommand, target: &str) -> Invocation {
    let (program, flags, stderr) = match (command, platform) {
        (ProbeCommand::Ping, _) => ("ping", vec!["-c", "4"], StderrMode::Kill),
        (ProbeCommand::Ping6, _) => ("ping6", vec!["-c", "4"], StderrMode::Kill),
        (ProbeCommand::Host, _) => ("host", vec!["-W", "10"], StderrMode::Kill),
        (ProbeCommand::Traceroute4, Platform::Linux) => {
            ("traceroute", vec!["-4", "-w2"], StderrMode::Forward)
        }
        (ProbeCommand::Traceroute4, Platform::MacOs) => {
            ("traceroute", vec!["-w2"], StderrMode::Forward)
        }
        (ProbeCommand::Traceroute6, Platform::Linux) => {
            ("traceroute", vec!["-6", "-w2"], StderrMode::Forward)
        }
        (ProbeCommand::Traceroute6, Platform::MacOs) => {
            ("traceroute6", vec!["-w2"], StderrMode::Forward)
        }
    };
    let mut args: Vec<String> = flags.into_iter().map(str::to_string).collect();
    args.push(target.to_string());
    Invocation {
        program: program.to_string(),
        args,
        stderr,
    }
}
