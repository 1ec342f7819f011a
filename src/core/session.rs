//! Session management
//!
//! Connects a child process on a PTY to a virtual terminal. A reader thread
//! forwards PTY output over a channel; the owner of the session pumps that
//! channel, which makes it the only caller that mutates the terminal.
//! Answerbacks produced while feeding are written back to the PTY.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use thiserror::Error;

use super::pty::{Pty, PtyCommand, PtyError};
use super::term::{Frame, Message, Observer, ScreenView, TermError, VirtualTerminal};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error(transparent)]
    Terminal(#[from] TermError),

    #[error("Failed to write to PTY: {0}")]
    Write(#[source] io::Error),

    #[error("Failed to start reader thread: {0}")]
    Thread(#[source] io::Error),
}

/// PTY input, shared between the session and an input relay
pub type PtyWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Write `data` to the PTY and flush
pub fn write_pty(writer: &PtyWriter, data: &[u8]) -> io::Result<()> {
    let mut writer = match writer.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    writer.write_all(data)?;
    writer.flush()
}

/// How to start a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub rows: u16,
    pub cols: u16,
    pub command: PtyCommand,
}

enum ReaderMsg {
    Data(Vec<u8>),
    Eof,
    Err(io::Error),
}

/// Forwards every message and keeps the answerback bytes for the PTY
struct Relay<O> {
    inner: O,
    answers: Vec<u8>,
}

impl<O: Observer> Observer for Relay<O> {
    fn notify(&mut self, message: Message<'_>, frame: &mut Frame<'_>) {
        if let Message::Answerback(bytes) = message {
            self.answers.extend_from_slice(bytes);
        }
        self.inner.notify(message, frame);
    }
}

/// A shell session
pub struct Session<O: Observer> {
    terminal: VirtualTerminal<Relay<O>>,
    pty: Pty,
    writer: PtyWriter,
    /// Channel to receive PTY output
    output_rx: Receiver<ReaderMsg>,
    /// Running flag
    running: Arc<AtomicBool>,
    reader_thread: Option<JoinHandle<()>>,
}

impl<O: Observer> Session<O> {
    /// Spawn the configured command and start reading its output
    pub fn start(config: &SessionConfig, observer: O) -> Result<Self, SessionError> {
        let relay = Relay {
            inner: observer,
            answers: Vec::new(),
        };
        let terminal = VirtualTerminal::open(config.rows, config.cols, relay)?;
        let pty = Pty::spawn(config.rows, config.cols, &config.command)?;
        let mut reader = pty.take_reader()?;
        let writer: PtyWriter = Arc::new(Mutex::new(pty.take_writer()?));

        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel::<ReaderMsg>();

        let flag = running.clone();
        let reader_thread = thread::Builder::new()
            .name("pty-reader".into())
            .spawn(move || {
                let mut buffer = [0u8; 4096];
                loop {
                    let msg = match reader.read(&mut buffer) {
                        Ok(0) => ReaderMsg::Eof,
                        Ok(n) => ReaderMsg::Data(buffer[..n].to_vec()),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => ReaderMsg::Err(e),
                    };
                    let done = !matches!(msg, ReaderMsg::Data(_));
                    if tx.send(msg).is_err() || done {
                        break;
                    }
                }
                flag.store(false, Ordering::SeqCst);
            })
            .map_err(SessionError::Thread)?;

        Ok(Self {
            terminal,
            pty,
            writer,
            output_rx: rx,
            running,
            reader_thread: Some(reader_thread),
        })
    }

    /// Handle for writing input to the child from another thread
    pub fn writer(&self) -> PtyWriter {
        self.writer.clone()
    }

    /// Write input to the PTY
    pub fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        write_pty(&self.writer, data).map_err(SessionError::Write)
    }

    /// Check if session is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Wait for output and process everything that has arrived.
    ///
    /// Returns `false` once the child's side of the PTY is closed.
    pub fn pump(&mut self) -> Result<bool, SessionError> {
        let first = match self.output_rx.recv() {
            Ok(msg) => msg,
            Err(_) => return Ok(self.stop()),
        };
        if !self.handle(first)? {
            return Ok(false);
        }
        self.process_output()
    }

    /// Read and process output from PTY (non-blocking)
    pub fn process_output(&mut self) -> Result<bool, SessionError> {
        loop {
            match self.output_rx.try_recv() {
                Ok(msg) => {
                    if !self.handle(msg)? {
                        return Ok(false);
                    }
                }
                Err(TryRecvError::Empty) => return Ok(true),
                Err(TryRecvError::Disconnected) => return Ok(self.stop()),
            }
        }
    }

    /// Feed raw bytes into the terminal
    pub fn feed_bytes(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        self.terminal.feed(bytes);
        self.send_answers()
    }

    /// Resize the terminal and the PTY
    pub fn resize(&mut self, rows: u16, cols: u16) -> Result<(), SessionError> {
        self.terminal.resize(rows, cols)?;
        self.pty.resize(rows, cols)?;
        Ok(())
    }

    /// Block until the child exits; returns its exit code
    pub fn wait(&mut self) -> Result<u32, SessionError> {
        Ok(self.pty.wait()?)
    }

    pub fn screen(&self) -> ScreenView<'_> {
        self.terminal.screen()
    }

    pub fn observer(&self) -> &O {
        &self.terminal.observer().inner
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.terminal.observer_mut().inner
    }

    fn handle(&mut self, msg: ReaderMsg) -> Result<bool, SessionError> {
        match msg {
            ReaderMsg::Data(data) => {
                self.feed_bytes(&data)?;
                Ok(true)
            }
            ReaderMsg::Eof => Ok(self.stop()),
            ReaderMsg::Err(e) => {
                // Linux reports EIO on the master once the child side closes
                tracing::debug!("PTY read ended: {}", e);
                Ok(self.stop())
            }
        }
    }

    fn stop(&mut self) -> bool {
        self.running.store(false, Ordering::SeqCst);
        false
    }

    /// Send answerback bytes back to the PTY
    fn send_answers(&mut self) -> Result<(), SessionError> {
        let answers = &mut self.terminal.observer_mut().answers;
        if answers.is_empty() {
            return Ok(());
        }
        let result = write_pty(&self.writer, answers);
        answers.clear();
        result.map_err(SessionError::Write)
    }
}

impl<O: Observer> Drop for Session<O> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if self.pty.is_running() {
            self.pty.kill();
        }

        // The reader only returns once every holder of the PTY slave is
        // gone, so a background grandchild can keep it blocked.
        if let Some(handle) = self.reader_thread.take() {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                tracing::debug!("Leaving PTY reader thread detached");
            }
        }
    }
}
