//! Child-process helpers shared across the workspace.
//!
//! Spawning goes through [`tokio_command`] so every child gets the same
//! platform flags, and teardown goes through [`shutdown_child`], which asks
//! the child to finish by closing its stdin before falling back to a kill.

use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self) -> &mut Self;
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) -> &mut Self {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
        self
    }
}

/// Create a `tokio::process::Command` for a long-running child.
///
/// The child is killed if its handle is dropped without being reaped, so a
/// panicking owner can never leak a process.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window().kill_on_drop(true);
    cmd
}

/// How a child ended during [`shutdown_child`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The child exited on its own within the timeout.
    Exited(Option<i32>),
    /// The child did not exit in time and was killed.
    Killed,
}

impl ShutdownOutcome {
    /// Whether the child had to be force-killed.
    pub fn was_killed(&self) -> bool {
        matches!(self, Self::Killed)
    }
}

/// Stop a child gracefully, force-killing it if it outlives `timeout`.
///
/// Dropping `stdin` delivers EOF, which is how pipe-fed encoders are told to
/// flush and exit.
#[cfg(feature = "tokio")]
pub async fn shutdown_child(
    child: &mut tokio::process::Child,
    stdin: Option<tokio::process::ChildStdin>,
    timeout: std::time::Duration,
) -> std::io::Result<ShutdownOutcome> {
    drop(stdin);
    drop(child.stdin.take());

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => Ok(ShutdownOutcome::Exited(status?.code())),
        Err(_) => {
            child.kill().await?;
            Ok(ShutdownOutcome::Killed)
        }
    }
}

#[cfg(all(test, unix, feature = "tokio"))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_child_exits_on_stdin_eof() {
        let mut child = tokio_command("sh")
            .args(["-c", "cat > /dev/null"])
            .stdin(Stdio::piped())
            .spawn()
            .unwrap();
        let stdin = child.stdin.take();

        let outcome = shutdown_child(&mut child, stdin, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(outcome, ShutdownOutcome::Exited(Some(0)));
        assert!(!outcome.was_killed());
    }

    #[tokio::test]
    async fn test_shutdown_child_kills_after_timeout() {
        let mut child = tokio_command("sh")
            .args(["-c", "sleep 30"])
            .stdin(Stdio::null())
            .spawn()
            .unwrap();

        let outcome = shutdown_child(&mut child, None, Duration::from_millis(200))
            .await
            .unwrap();

        assert!(outcome.was_killed());
    }
}
