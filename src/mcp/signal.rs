//! Interrupting whatever the shell is currently running.
//!
//! The shell is spawned as the leader of its own process group, so one
//! `SIGINT` to the group reaches the foreground command and all of its
//! children. The interactive shell itself survives the signal and goes back
//! to reading commands.

use tracing::{info, warn};

use super::error::{Result, ShellError};

/// Which target received the interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptTarget {
    ProcessGroup,
    /// Group signalling failed; only the shell process was signalled
    Process,
}

/// Sends `SIGINT` to the shell's process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessGroupCanceller {
    pid: u32,
}

impl ProcessGroupCanceller {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Interrupt the group, falling back to the process itself.
    #[cfg(unix)]
    pub fn interrupt(&self) -> Result<InterruptTarget> {
        use nix::sys::signal::{Signal, kill, killpg};
        use nix::unistd::Pid;

        let raw = i32::try_from(self.pid)
            .map_err(|_| ShellError::Interrupt(format!("pid {} out of range", self.pid)))?;
        let pid = Pid::from_raw(raw);

        match killpg(pid, Signal::SIGINT) {
            Ok(()) => {
                info!(pgid = raw, "sent SIGINT to shell process group");
                Ok(InterruptTarget::ProcessGroup)
            }
            Err(group_err) => {
                warn!(pgid = raw, %group_err, "SIGINT to process group failed, signalling shell");
                kill(pid, Signal::SIGINT)
                    .map(|()| InterruptTarget::Process)
                    .map_err(|process_err| {
                        ShellError::Interrupt(format!(
                            "process group: {group_err}; process: {process_err}"
                        ))
                    })
            }
        }
    }

    #[cfg(not(unix))]
    pub fn interrupt(&self) -> Result<InterruptTarget> {
        Err(ShellError::Interrupt(format!(
            "signals are not supported on this platform (pid {})",
            self.pid
        )))
    }

    /// `SIGKILL` the whole group, the shell included.
    #[cfg(unix)]
    pub fn kill_group(&self) -> Result<()> {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let raw = i32::try_from(self.pid)
            .map_err(|_| ShellError::Interrupt(format!("pid {} out of range", self.pid)))?;
        killpg(Pid::from_raw(raw), Signal::SIGKILL)
            .map_err(|err| ShellError::Interrupt(format!("process group: {err}")))?;
        warn!(pgid = raw, "sent SIGKILL to shell process group");
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn kill_group(&self) -> Result<()> {
        Err(ShellError::Interrupt(format!(
            "signals are not supported on this platform (pid {})",
            self.pid
        )))
    }
}
