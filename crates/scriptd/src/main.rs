//! scriptd CLI entry point.
//!
//! `scriptd run` starts the daemon; the other subcommands talk to a
//! running one.

use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kernel_exec::{ClientEvent, ErrorPolicy, OutputItem};
use log::info;
use scriptd::client::ScriptdClient;
use scriptd::daemon::{Daemon, DaemonConfig};
use scriptd::kernel::KernelConfig;
use scriptd::registry::RegistryConfig;
use scriptd::session::{ConcurrencyPolicy, ExecuteRequest, SessionConfig};

#[derive(Parser, Debug)]
#[command(name = "scriptd")]
#[command(about = "Run scripts unit by unit against long-lived Jupyter kernels")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Socket path (default: ~/.cache/scriptd/scriptd.sock)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon (default if no command specified)
    Run(RunArgs),

    /// Execute a script in a session and print its output
    Exec {
        /// Script file, or `-` for stdin
        file: PathBuf,

        /// Session to run in
        #[arg(long, default_value = "default")]
        session: String,

        /// First line to run (1-based)
        #[arg(long)]
        from: Option<usize>,

        /// Last line to run (inclusive)
        #[arg(long)]
        to: Option<usize>,

        /// Restart the kernel before running
        #[arg(long)]
        reset: bool,

        /// Print raw events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// List sessions on the running daemon
    Status {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Shut down a session and its kernel
    Delete { session: String },

    /// Stop the running daemon
    Stop,
}

#[derive(clap::Args, Debug, Default)]
struct RunArgs {
    /// Kernelspec to launch
    #[arg(long, default_value = "python3")]
    kernel: String,

    /// Launch ipykernel from this interpreter instead of a kernelspec
    #[arg(long)]
    python: Option<PathBuf>,

    /// Working directory for kernels
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Code to run silently whenever a kernel starts
    #[arg(long)]
    startup_code: Option<String>,

    /// Queue scripts submitted while a session is busy instead of rejecting them
    #[arg(long)]
    queue: bool,

    /// Keep running later units after one fails
    #[arg(long)]
    continue_on_error: bool,

    /// Seconds an interrupted kernel has before it is restarted
    #[arg(long, default_value = "5")]
    interrupt_grace_secs: u64,

    /// Restart a kernel that produces no output for this many seconds (0 disables)
    #[arg(long, default_value = "300")]
    message_timeout_secs: u64,

    /// Evict sessions idle for this many seconds
    #[arg(long, default_value = "3600")]
    idle_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let socket_path = cli.socket.unwrap_or_else(scriptd::default_socket_path);

    match cli.command {
        None => run_daemon(socket_path, RunArgs::default_for_cli()).await,
        Some(Commands::Run(args)) => run_daemon(socket_path, args).await,
        Some(Commands::Exec {
            file,
            session,
            from,
            to,
            reset,
            json,
        }) => exec(socket_path, file, session, from, to, reset, json).await,
        Some(Commands::Status { json }) => status(socket_path, json).await,
        Some(Commands::Delete { session }) => {
            ScriptdClient::new(socket_path)
                .delete_session(&session)
                .await?;
            println!("Deleted session {}", session);
            Ok(())
        }
        Some(Commands::Stop) => {
            ScriptdClient::new(socket_path).shutdown().await?;
            println!("Daemon shutting down");
            Ok(())
        }
    }
}

impl RunArgs {
    /// Same values clap would fill in for a bare `scriptd run`.
    fn default_for_cli() -> Self {
        Self {
            kernel: "python3".to_string(),
            interrupt_grace_secs: 5,
            message_timeout_secs: 300,
            idle_timeout_secs: 3600,
            ..Default::default()
        }
    }
}

async fn run_daemon(socket_path: PathBuf, args: RunArgs) -> anyhow::Result<()> {
    info!("scriptd starting...");

    let kernel = KernelConfig {
        kernel_name: args.kernel,
        python: args.python,
        working_dir: args.cwd,
        startup_code: args.startup_code,
        ..Default::default()
    };
    let session = SessionConfig {
        concurrency: if args.queue {
            ConcurrencyPolicy::Queue
        } else {
            ConcurrencyPolicy::RejectWhenBusy
        },
        error_policy: if args.continue_on_error {
            ErrorPolicy::ContinueOnError
        } else {
            ErrorPolicy::HaltOnError
        },
        interrupt_grace: Duration::from_secs(args.interrupt_grace_secs),
        message_timeout: (args.message_timeout_secs > 0)
            .then(|| Duration::from_secs(args.message_timeout_secs)),
        ..Default::default()
    };
    let config = DaemonConfig {
        socket_path,
        registry: RegistryConfig {
            session,
            idle_timeout: Duration::from_secs(args.idle_timeout_secs),
            ..Default::default()
        },
    };

    info!("Configuration:");
    info!("  Socket: {:?}", config.socket_path);
    info!("  Kernel: {}", kernel.kernel_name);
    if let Some(python) = &kernel.python {
        info!("  Python: {:?}", python);
    }
    info!("  Concurrency: {:?}", config.registry.session.concurrency);
    info!("  Error policy: {:?}", config.registry.session.error_policy);
    info!("  Idle timeout: {:?}", config.registry.idle_timeout);

    let daemon = Daemon::new(config, kernel);
    let signal_daemon = daemon.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C");
            signal_daemon.trigger_shutdown();
        }
    });
    daemon.run().await
}

async fn exec(
    socket_path: PathBuf,
    file: PathBuf,
    session: String,
    from: Option<usize>,
    to: Option<usize>,
    reset: bool,
    json: bool,
) -> anyhow::Result<()> {
    let script = if file.as_os_str() == "-" {
        let mut script = String::new();
        std::io::stdin().read_to_string(&mut script)?;
        script
    } else {
        std::fs::read_to_string(&file)?
    };

    let mut request = ExecuteRequest::new(script);
    if from.is_some() || to.is_some() {
        request = request.with_line_range(from.unwrap_or(1), to.unwrap_or(usize::MAX));
    }
    if reset {
        request = request.with_reset();
    }

    let client = ScriptdClient::new(socket_path);
    let mut connection = client.open_session(&session).await?;
    let events = connection.run(request).await?;

    let mut failed = false;
    for event in &events {
        if json {
            println!("{}", serde_json::to_string(event)?);
            continue;
        }
        match event {
            ClientEvent::UnitResult(result) => {
                for item in &result.output {
                    print_output(result.line_start, item);
                }
                failed |= result.has_error();
            }
            ClientEvent::Cancelled { remaining, .. } if !remaining.is_empty() => {
                eprintln!("Skipped {} remaining units", remaining.len());
            }
            ClientEvent::Error { message, .. } => {
                eprintln!("Error: {}", message);
                failed = true;
            }
            ClientEvent::Busy { .. } => {
                eprintln!("Session {} is busy", session);
                failed = true;
            }
            _ => {}
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn print_output(line: usize, item: &OutputItem) {
    match item.kind.as_str() {
        "stdout" => print!("{}", item.content),
        "stderr" | "error" => eprint!("{}", with_newline(&item.content)),
        "text/plain" | "text/markdown" => print!("{}", with_newline(&item.content)),
        kind => println!("[line {}: {} output, {} bytes]", line, kind, item.content.len()),
    }
}

fn with_newline(text: &str) -> String {
    if text.ends_with('\n') {
        text.to_string()
    } else {
        format!("{}\n", text)
    }
}

async fn status(socket_path: PathBuf, json: bool) -> anyhow::Result<()> {
    let client = ScriptdClient::new(socket_path.clone());
    let sessions = match client.list_sessions().await {
        Ok(sessions) => sessions,
        Err(e) => {
            if json {
                println!("{}", serde_json::json!({"running": false}));
            } else {
                println!("Daemon is not running at {:?} ({})", socket_path, e);
            }
            return Ok(());
        }
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "running": true,
                "socket": socket_path,
                "sessions": sessions,
            }))?
        );
        return Ok(());
    }

    println!("Daemon running at {:?}", socket_path);
    if sessions.is_empty() {
        println!("No sessions");
    }
    for session in sessions {
        println!(
            "  {:<24} {:<5} idle {}s",
            session.session_id,
            if session.busy { "busy" } else { "idle" },
            session.idle_secs
        );
    }
    Ok(())
}
