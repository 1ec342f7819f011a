//! Pseudo terminal wrapper
//!
//! Spawns a child process attached to a PTY and exposes the master side as a
//! reader/writer pair, plus resize and process control.

use std::io::{self, Read, Write};
use std::path::PathBuf;

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open pseudo terminal: {0}")]
    Open(String),

    #[error("Failed to spawn process: {0}")]
    ProcessSpawn(String),

    #[error("Failed to resize pseudo terminal: {0}")]
    Resize(String),

    #[error("Failed to access PTY stream: {0}")]
    Stream(String),

    #[error("Failed to wait for process: {0}")]
    Wait(#[source] io::Error),
}

pub type Result<T> = std::result::Result<T, PtyError>;

/// Program, arguments and extra environment for the child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl PtyCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: std::env::current_dir().ok(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn to_builder(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &self.cwd {
            cmd.cwd(cwd);
        }
        cmd
    }
}

/// A child process running on a pseudo terminal
pub struct Pty {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    rows: u16,
    cols: u16,
}

impl Pty {
    /// Open a PTY of `rows` x `cols` and spawn `command` on it
    pub fn spawn(rows: u16, cols: u16, command: &PtyCommand) -> Result<Self> {
        let pair = native_pty_system()
            .openpty(pty_size(rows, cols))
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let child = pair
            .slave
            .spawn_command(command.to_builder())
            .map_err(|e| PtyError::ProcessSpawn(e.to_string()))?;

        // Only the child may hold the slave, otherwise reads never see EOF
        drop(pair.slave);

        tracing::info!(
            "Spawned {} (pid {:?}) on a {}x{} PTY",
            command.program,
            child.process_id(),
            rows,
            cols
        );

        Ok(Self {
            master: pair.master,
            child,
            rows,
            cols,
        })
    }

    /// A reader for the child's output
    pub fn take_reader(&self) -> Result<Box<dyn Read + Send>> {
        self.master
            .try_clone_reader()
            .map_err(|e| PtyError::Stream(e.to_string()))
    }

    /// The writer for the child's input. Can only be taken once.
    pub fn take_writer(&self) -> Result<Box<dyn Write + Send>> {
        self.master
            .take_writer()
            .map_err(|e| PtyError::Stream(e.to_string()))
    }

    pub fn resize(&mut self, rows: u16, cols: u16) -> Result<()> {
        self.master
            .resize(pty_size(rows, cols))
            .map_err(|e| PtyError::Resize(e.to_string()))?;
        self.rows = rows;
        self.cols = cols;
        Ok(())
    }

    /// Check if the child is still running
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Exit code, if the child has exited
    pub fn exit_code(&mut self) -> Option<u32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.exit_code()),
            _ => None,
        }
    }

    /// Block until the child exits
    pub fn wait(&mut self) -> Result<u32> {
        let status = self.child.wait().map_err(PtyError::Wait)?;
        Ok(status.exit_code())
    }

    pub fn kill(&mut self) {
        if let Err(e) = self.child.kill() {
            tracing::debug!("Failed to kill child: {}", e);
        }
    }

    /// (rows, cols)
    pub fn size(&self) -> (u16, u16) {
        (self.rows, self.cols)
    }
}

fn pty_size(rows: u16, cols: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_reads_output_and_exit_code() {
        let command = PtyCommand::new("sh").arg("-c").arg("printf pty-ok; exit 3");
        let mut pty = Pty::spawn(4, 20, &command).unwrap();
        let mut reader = pty.take_reader().unwrap();

        let mut output = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => output.extend_from_slice(&buf[..n]),
            }
        }

        assert!(String::from_utf8_lossy(&output).contains("pty-ok"));
        assert_eq!(pty.wait().unwrap(), 3);
        assert!(!pty.is_running());
        assert_eq!(pty.exit_code(), Some(3));
    }

    #[test]
    fn test_resize_updates_size() {
        let command = PtyCommand::new("sh").arg("-c").arg("exit 0");
        let mut pty = Pty::spawn(4, 20, &command).unwrap();
        pty.resize(10, 40).unwrap();
        assert_eq!(pty.size(), (10, 40));
        pty.wait().unwrap();
    }

    #[test]
    fn test_command_builder() {
        let command = PtyCommand::new("sh")
            .args(["-c", "true"])
            .env("TERM", "ansi");
        assert_eq!(command.args, vec!["-c".to_string(), "true".to_string()]);
        assert_eq!(command.env, vec![("TERM".to_string(), "ansi".to_string())]);
    }
}
