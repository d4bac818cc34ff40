//! PTY wrapper using portable-pty.
//!
//! Opens a pseudo-terminal running a shell with a given size, working
//! directory, and environment snapshot, providing raw write, kill, and
//! wait operations. Reads go through the reader handed back by [`PtyHandle::spawn`],
//! which the registry drives from a blocking task.

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};
use termrelay_core::{RelayError, RelayResult};

/// A managed PTY instance.
pub struct PtyHandle {
    writer: Mutex<Box<dyn Write + Send>>,
    /// Child process handle.
    child: Mutex<Box<dyn portable_pty::Child + Send>>,
    /// Master side of the PTY. Held so the PTY stays open for the session's
    /// lifetime (Mutex because MasterPty is not Sync).
    _master: Mutex<Box<dyn MasterPty + Send>>,
}

impl PtyHandle {
    /// Spawn a new PTY with the given command, geometry, cwd, and environment.
    ///
    /// If `command` is None, the default shell is used (`$SHELL`, falling
    /// back to `/bin/sh`). The environment is applied as an explicit
    /// snapshot: nothing is inherited beyond `env`.
    ///
    /// Returns the handle plus the output reader, which the caller owns and
    /// drives to completion.
    pub fn spawn(
        command: Option<&str>,
        cwd: &Path,
        cols: u16,
        rows: u16,
        env: &HashMap<String, String>,
    ) -> RelayResult<(Self, Box<dyn Read + Send>)> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(size)
            .map_err(|e| RelayError::Spawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = if let Some(command) = command {
            let parts: Vec<&str> = command.split_whitespace().collect();
            if parts.is_empty() {
                return Err(RelayError::Spawn("empty command".into()));
            }
            let mut builder = CommandBuilder::new(parts[0]);
            for arg in &parts[1..] {
                builder.arg(arg);
            }
            builder
        } else {
            let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
            CommandBuilder::new(shell)
        };

        cmd.cwd(cwd);

        // Explicit environment snapshot, not inherited implicitly.
        cmd.env_clear();
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| RelayError::Spawn(format!("failed to spawn command: {e}")))?;

        info!(cols, rows, cwd = %cwd.display(), "PTY spawned");

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| RelayError::Spawn(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| RelayError::Spawn(format!("failed to take PTY writer: {e}")))?;

        Ok((
            Self {
                writer: Mutex::new(writer),
                child: Mutex::new(child),
                _master: Mutex::new(pair.master),
            },
            reader,
        ))
    }

    /// Write raw bytes to the PTY input (blocking — call from a
    /// spawn_blocking context). No terminator is appended.
    pub fn write(&self, data: &[u8]) -> RelayResult<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| RelayError::WriteFailure("PTY writer lock poisoned".into()))?;
        writer
            .write_all(data)
            .map_err(|e| RelayError::WriteFailure(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| RelayError::WriteFailure(e.to_string()))?;
        Ok(())
    }

    /// Kill the child process. Killing an already-dead process is reported
    /// as an error by the OS; callers on destroy paths ignore it.
    pub fn kill(&self) -> RelayResult<()> {
        let mut child = self
            .child
            .lock()
            .map_err(|_| RelayError::Other("child lock poisoned".into()))?;
        child
            .kill()
            .map_err(|e| RelayError::Other(format!("kill failed: {e}")))?;
        Ok(())
    }

    /// Wait for the child to exit and return its exit code (blocking — call
    /// from a spawn_blocking context). Returns -1 if the status cannot be
    /// determined.
    pub fn wait_code(&self) -> i32 {
        let mut child = match self.child.lock() {
            Ok(c) => c,
            Err(_) => return -1,
        };
        match child.wait() {
            Ok(status) => {
                let code = status.exit_code().try_into().unwrap_or(-1);
                debug!(code, "PTY child exited");
                code
            }
            Err(_) => -1,
        }
    }
}
