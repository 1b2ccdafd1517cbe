use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};

use system_utils::process::{apply_process_group, kill_child, reap_child};

use super::invocation::{Invocation, StderrMode};
use super::lines::LineReader;

const EXIT_GRACE: Duration = Duration::from_secs(2);
const STDERR_LINE_QUEUE: usize = 64;

enum StderrWatch {
    Trip(oneshot::Receiver<()>),
    Lines(mpsc::Receiver<String>),
    Closed,
}

/// A running probe process and its output.
///
/// Owned by exactly one execution; dropping it kills the process.
pub(crate) struct ProbeHandle {
    child: Child,
    stdout: LineReader<ChildStdout>,
    stdout_done: bool,
    stderr: StderrWatch,
    killed: bool,
}

impl ProbeHandle {
    pub(crate) fn spawn(invocation: &Invocation, line_buffer: usize) -> io::Result<Self> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        apply_process_group(&mut cmd);
        let mut child = cmd.spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "missing stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "missing stderr"))?;
        let stderr = match invocation.stderr {
            StderrMode::Kill => StderrWatch::Trip(spawn_stderr_trip(stderr)),
            StderrMode::Forward => StderrWatch::Lines(spawn_stderr_lines(stderr, line_buffer)),
        };

        Ok(Self {
            child,
            stdout: LineReader::new(stdout, line_buffer),
            stdout_done: false,
            stderr,
            killed: false,
        })
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Next line of output, or `None` once the process has nothing more to
    /// say. Cancel-safe, so it can race a timer in `select!`.
    pub(crate) async fn next_line(&mut self) -> Option<String> {
        loop {
            if self.stdout_done {
                return match &mut self.stderr {
                    StderrWatch::Lines(rx) => rx.recv().await,
                    StderrWatch::Trip(_) | StderrWatch::Closed => None,
                };
            }
            tokio::select! {
                line = self.stdout.next_line() => match line {
                    Ok(Some(line)) => return Some(line),
                    Ok(None) => self.stdout_done = true,
                    Err(err) => {
                        tracing::warn!(event = "probe.stdout_error", error = %err);
                        self.stdout_done = true;
                    }
                },
                event = next_stderr_event(&mut self.stderr) => match event {
                    StderrEvent::Tripped => {
                        self.stderr = StderrWatch::Closed;
                        tracing::info!(event = "probe.stderr_kill", pid = ?self.child.id());
                        self.kill().await;
                    }
                    StderrEvent::Line(line) => return Some(line),
                    StderrEvent::Closed => self.stderr = StderrWatch::Closed,
                },
            }
        }
    }

    /// Forcibly ends the process. Safe to call more than once.
    pub(crate) async fn kill(&mut self) -> Option<ExitStatus> {
        self.killed = true;
        kill_child(&mut self.child).await
    }

    /// Reaps a process whose output has ended, killing it if it lingers.
    pub(crate) async fn finish(mut self) -> Option<ExitStatus> {
        if self.killed {
            return self.kill().await;
        }
        reap_child(&mut self.child, EXIT_GRACE).await
    }
}

enum StderrEvent {
    Tripped,
    Line(String),
    Closed,
}

async fn next_stderr_event(watch: &mut StderrWatch) -> StderrEvent {
    match watch {
        StderrWatch::Trip(rx) => match rx.await {
            Ok(()) => StderrEvent::Tripped,
            Err(_) => StderrEvent::Closed,
        },
        StderrWatch::Lines(rx) => match rx.recv().await {
            Some(line) => StderrEvent::Line(line),
            None => StderrEvent::Closed,
        },
        StderrWatch::Closed => std::future::pending().await,
    }
}

// Fires once the tool writes anything to stderr. A stderr that closes
// silently drops the sender instead.
fn spawn_stderr_trip(mut stderr: ChildStderr) -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut buf = [0u8; 16];
        if let Ok(n) = stderr.read(&mut buf).await {
            if n > 0 {
                let _ = tx.send(());
            }
        }
    });
    rx
}

fn spawn_stderr_lines(stderr: ChildStderr, line_buffer: usize) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(STDERR_LINE_QUEUE);
    tokio::spawn(async move {
        let mut reader = LineReader::new(stderr, line_buffer);
        while let Ok(Some(line)) = reader.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
    rx
}
