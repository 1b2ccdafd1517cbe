use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::{Child, Command};

/// Starts the child in a new session so a signal sent to its process group
/// also reaches helpers it forks.
#[cfg(unix)]
pub fn apply_process_group(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
pub fn apply_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
pub fn signal_group(child: &Child, signal: i32) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as i32), signal);
        }
    }
}

#[cfg(not(unix))]
pub fn signal_group(_child: &Child, _signal: i32) {}

#[cfg(unix)]
const SIGKILL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

/// Forcibly terminates the child and its group, then reaps it.
pub async fn kill_child(child: &mut Child) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }
    signal_group(child, SIGKILL);
    let _ = child.kill().await;
    child.wait().await.ok()
}

/// Waits up to `grace` for a child that is expected to exit on its own,
/// killing it if it does not.
pub async fn reap_child(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => kill_child(child).await,
    }
}
