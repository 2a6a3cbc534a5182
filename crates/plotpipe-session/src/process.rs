//! Engine child process handling over plain stdio pipes.

use std::io::Write;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};

use tracing::{debug, error, info, warn};

use plotpipe_core::{EngineSettings, Error, Result};

/// Handle to a spawned engine process.
///
/// Owns the child and its stdin. Stdout and stderr are handed to the line
/// readers at spawn time.
pub struct EngineProcess {
    /// Program that was launched
    program: String,
    /// The child process
    child: Child,
    /// Engine stdin (None once closed)
    stdin: Option<ChildStdin>,
}

impl std::fmt::Debug for EngineProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineProcess")
            .field("program", &self.program)
            .field("pid", &self.child.id())
            .finish_non_exhaustive()
    }
}

impl EngineProcess {
    /// Spawn the engine with all three standard streams piped.
    ///
    /// The program is executed directly, without a shell. Returns the handle
    /// together with the stdout and stderr pipes.
    pub fn spawn(settings: &EngineSettings) -> Result<(Self, ChildStdout, ChildStderr)> {
        info!(
            "Spawning engine: program='{}' args={:?}, cwd={:?}",
            settings.program, settings.args, settings.working_directory
        );

        let mut cmd = Command::new(&settings.program);
        cmd.args(&settings.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(dir) = &settings.working_directory {
            debug!("Setting working directory to: {}", dir);
            cmd.current_dir(dir);
        }

        for (key, value) in &settings.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn engine '{}': {}", settings.program, e);
            Error::Spawn {
                program: settings.program.clone(),
                source: e,
            }
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (Some(stdin), Some(stdout), Some(stderr)) = (stdin, stdout, stderr) else {
            // Unreachable with Stdio::piped, but never leave the child behind
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Spawn {
                program: settings.program.clone(),
                source: std::io::Error::other("engine pipes unavailable"),
            });
        };

        info!(
            "Engine spawned successfully: program='{}', pid={}",
            settings.program,
            child.id()
        );

        Ok((
            Self {
                program: settings.program.clone(),
                child,
                stdin: Some(stdin),
            },
            stdout,
            stderr,
        ))
    }

    /// OS process id.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Write a payload to the engine and flush it.
    ///
    /// Any write failure means the engine is gone and is reported as
    /// [`Error::BrokenPipe`].
    pub fn write(&mut self, data: &str) -> Result<usize> {
        let stdin = self.stdin.as_mut().ok_or(Error::SessionTerminated)?;

        debug!("Writing {} bytes to engine", data.len());
        stdin
            .write_all(data.as_bytes())
            .and_then(|()| stdin.flush())
            .map_err(|e| {
                warn!("Write to engine '{}' failed: {}", self.program, e);
                Error::BrokenPipe(e.to_string())
            })?;

        Ok(data.len())
    }

    /// Check if the engine is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Close the engine's stdin; the engine sees end-of-input.
    pub fn close_stdin(&mut self) {
        if self.stdin.take().is_some() {
            debug!("Closed stdin of engine '{}'", self.program);
        }
    }

    /// Kill the engine and reap it.
    ///
    /// An engine that already exited is not an error.
    pub fn kill(&mut self) -> Result<()> {
        info!("Killing engine process: pid={}", self.child.id());
        self.close_stdin();

        if self.is_alive() {
            if let Err(e) = self.child.kill() {
                // The child can exit between the check and the kill
                if e.kind() != std::io::ErrorKind::InvalidInput {
                    error!("Failed to kill engine pid={}: {}", self.child.id(), e);
                    return Err(Error::Io(e));
                }
            }
        }

        let status = self.child.wait()?;
        debug!("Engine exited: pid={}, status={}", self.child.id(), status);
        Ok(())
    }
}
