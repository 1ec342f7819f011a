//! vtshell - run a shell inside an inline virtual terminal
//!
//! The child runs on a pseudo terminal. Its output is interpreted by a
//! virtual terminal and drawn into a fixed band of lines below the prompt,
//! redrawing only the rows that changed. Keyboard input is relayed to the
//! child untouched.
//!
//! # Quick Start
//!
//! ```text
//! vtshell                  # $SHELL in a 10-line band
//! vtshell -H 20 -s bash    # bash in a 20-line band
//! vtshell -- top -d 1      # any command
//! ```

use std::env;
use std::fs::OpenOptions;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread;

use anyhow::Context;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use vtshell::config::{self, Config};
use vtshell::core::pty::PtyCommand;
use vtshell::core::session::{write_pty, PtyWriter, Session, SessionConfig};
use vtshell::ui::{terminal, InlineRenderer, RawModeGuard};

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Command line options. Unset values come from the config file.
#[derive(Debug, Default, PartialEq, Eq)]
struct Options {
    /// Shell command line (`-s`)
    shell: Option<String>,
    /// Rows of the virtual terminal
    height: Option<u16>,
    /// TERM for the child
    term: Option<String>,
    no_bell: bool,
    /// Command after `--`
    command: Vec<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum Action {
    Run(Options),
    InitConfig,
    Help,
    Version,
}

fn print_version() {
    eprintln!("vtshell {}", VERSION);
}

fn print_help() {
    eprintln!("vtshell {} - Run a shell inside an inline virtual terminal", VERSION);
    eprintln!();
    eprintln!("Usage: vtshell [OPTIONS] [-- COMMAND [ARGS...]]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -s, --shell <CMD>     Shell command line (default: $SHELL, then /bin/sh)");
    eprintln!("  -H, --height <ROWS>   Rows of the virtual terminal (default: 10)");
    eprintln!("  -t, --term <NAME>     TERM for the child (default: ansi)");
    eprintln!("      --no-bell         Do not forward bells");
    eprintln!("      --init-config     Write a default config file and exit");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Configuration: ~/.vtshell/config.toml");
    eprintln!("Log file:      ~/.vtshell/vtshell.log (filter with VTSHELL_LOG)");
    eprintln!();
    eprintln!("Exit: the session ends when the command exits");
}

fn parse_args<I>(args: I) -> Result<Action, String>
where
    I: IntoIterator<Item = String>,
{
    let mut options = Options::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Action::Help),
            "-v" | "--version" => return Ok(Action::Version),
            "--init-config" => return Ok(Action::InitConfig),
            "-s" | "--shell" => {
                let shell = args.next().ok_or("Missing shell argument")?;
                options.shell = Some(shell);
            }
            "-H" | "--height" => {
                let value = args.next().ok_or("Missing height argument")?;
                let height = value
                    .parse::<u16>()
                    .ok()
                    .filter(|h| *h > 0)
                    .ok_or_else(|| format!("Invalid height: {}", value))?;
                options.height = Some(height);
            }
            "-t" | "--term" => {
                let term = args.next().ok_or("Missing term argument")?;
                options.term = Some(term);
            }
            "--no-bell" => options.no_bell = true,
            "--" => {
                options.command = args.by_ref().collect();
                if options.command.is_empty() {
                    return Err("Missing command after --".to_string());
                }
            }
            arg => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
        }
    }

    Ok(Action::Run(options))
}

/// The child's command line: `-- COMMAND`, else `-s`, else the config shell
fn build_command(options: &Options, config: &Config, term: &str) -> PtyCommand {
    let command = match options.command.split_first() {
        Some((program, args)) => PtyCommand::new(program.as_str()).args(args.iter().cloned()),
        None => {
            let line = options
                .shell
                .clone()
                .unwrap_or_else(|| config.shell_command());
            let mut words = line.split_whitespace();
            let program = words.next().unwrap_or("/bin/sh");
            PtyCommand::new(program).args(words)
        }
    };

    // Set environment variable so child processes can detect vtshell
    command
        .env("TERM", term)
        .env("VTSHELL", "1")
        .env("VTSHELL_VERSION", VERSION)
}

/// Initialize logging to file; stdout belongs to the rendered terminal
fn init_logging(default_filter: &str) {
    let log_path = config::config_dir()
        .map(|dir| dir.join("vtshell.log"))
        .unwrap_or_else(|| PathBuf::from("vtshell.log"));

    // Create log directory if needed
    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    // Open log file (append mode)
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_env("VTSHELL_LOG")
            .unwrap_or_else(|_| EnvFilter::new(default_filter));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

/// Copy keyboard input to the child until stdin closes
fn spawn_stdin_relay(writer: PtyWriter) -> io::Result<()> {
    thread::Builder::new()
        .name("stdin-relay".into())
        .spawn(move || {
            let mut stdin = io::stdin().lock();
            let mut buffer = [0u8; 1024];
            loop {
                match stdin.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = write_pty(&writer, &buffer[..n]) {
                            debug!("Stopping input relay: {}", e);
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("Failed to read stdin: {}", e);
                        break;
                    }
                }
            }
        })?;
    Ok(())
}

/// Write the default configuration unless a config file already exists
fn init_config() -> anyhow::Result<()> {
    if let Some(path) = Config::config_path().filter(|path| path.exists()) {
        eprintln!("Config file already exists: {}", path.display());
        return Ok(());
    }
    let path = Config::default()
        .save()
        .context("Failed to write config file")?;
    eprintln!("Wrote {}", path.display());
    Ok(())
}

/// Run the session; returns the child's exit code
fn run(options: Options, config: Config) -> anyhow::Result<u32> {
    let term = options.term.clone().unwrap_or_else(|| config.term.clone());
    let bell = config.bell && !options.no_bell;
    let command = build_command(&options, &config, &term);

    let (screen_rows, cols) = terminal::size().unwrap_or((24, 80));
    let rows = options
        .height
        .unwrap_or(config.height)
        .clamp(1, screen_rows.max(1));

    info!("Command: {} {:?}", command.program, command.args);
    info!("Virtual terminal: {}x{}, TERM={}", rows, cols, term);

    let renderer = InlineRenderer::new(io::stdout(), bell);
    let session_config = SessionConfig {
        rows,
        cols,
        command,
    };
    let mut session =
        Session::start(&session_config, renderer).context("Failed to start session")?;

    let raw_mode = if terminal::stdin_is_tty() {
        Some(RawModeGuard::enable().context("Failed to enable raw mode")?)
    } else {
        None
    };

    spawn_stdin_relay(session.writer()).context("Failed to start input relay")?;

    let mut result = Ok(());
    loop {
        match session.pump() {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }

    if let Err(e) = session.observer_mut().finish() {
        warn!("Failed to leave the render band: {}", e);
    }
    drop(raw_mode);
    result.context("Session failed")?;

    let code = session.wait().context("Failed to wait for child")?;
    info!("Child exited with code {}", code);
    Ok(code)
}

fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let options = match parse_args(env::args().skip(1)) {
        Ok(Action::Run(options)) => options,
        Ok(Action::Help) => {
            print_help();
            return Ok(());
        }
        Ok(Action::Version) => {
            print_version();
            return Ok(());
        }
        Ok(Action::InitConfig) => return init_config(),
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    let (config, config_error) = match Config::try_load() {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };
    init_logging(&config.log_level);
    if let Some(e) = config_error {
        warn!("Ignoring config file: {}", e);
    }

    info!("vtshell {} starting...", VERSION);

    let code = run(options, config)?;
    std::process::exit(code.min(i32::MAX as u32) as i32);
}
