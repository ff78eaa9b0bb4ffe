use clap::{Parser, Subcommand};
use live_log::api::ProcessInfo;
use live_log::client::{ClientError, ProcessClient};
use live_log::config::{self, LiveLogConfig};
use live_log::tail;
use std::io::Write;
use std::path::PathBuf;

/// Start a command on a remote process manager and stream its live log
/// to stdout until the process finishes.
#[derive(Parser, Debug)]
#[command(name = "live-log", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "live-log.toml")]
    config: PathBuf,

    /// Service host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Service port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// API path prefix, e.g. /api/v1 (overrides config)
    #[arg(long)]
    api_prefix: Option<String>,

    /// Command to run remotely (overrides config)
    #[arg(long)]
    cmd: Option<String>,

    /// Extra logging (request URLs, chunk sizes)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log errors and warnings
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List processes on the service
    List,
    /// Show one process and its buffered log
    Show {
        /// Process identifier
        uuid: String,
    },
    /// Follow the live log of an existing process
    Tail {
        /// Process identifier
        uuid: String,
    },
    /// Kill a process and remove it from the service
    Kill {
        /// Process identifier
        uuid: String,
    },
}

impl Cli {
    fn apply_overrides(&self, config: &mut LiveLogConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(prefix) = &self.api_prefix {
            config.server.api_prefix = prefix.clone();
        }
        if let Some(cmd) = &self.cmd {
            config.process.command = cmd.clone();
        }
    }

    fn default_filter(&self) -> &'static str {
        if self.verbose {
            "live_log=debug"
        } else if self.quiet {
            "live_log=warn"
        } else {
            "live_log=info"
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Log lines own stdout; diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.default_filter())),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match config::load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(1);
        }
    };
    cli.apply_overrides(&mut config);

    if let Err(e) = run(&cli, &config).await {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

async fn run(cli: &Cli, config: &LiveLogConfig) -> Result<(), ClientError> {
    let client = ProcessClient::new(&config.server)?;
    let stdout = std::io::stdout();

    match &cli.command {
        None => {
            tail::launch_and_tail(&client, &config.process.command, &mut stdout.lock()).await?;
        }
        Some(Command::Tail { uuid }) => {
            tail::tail_process(&client, uuid, &mut stdout.lock()).await?;
        }
        Some(Command::List) => {
            let processes = client.list().await?;
            write_process_list(&mut stdout.lock(), &processes).map_err(ClientError::Output)?;
        }
        Some(Command::Show { uuid }) => {
            let process = client.get(uuid).await?;
            write_process(&mut stdout.lock(), &process).map_err(ClientError::Output)?;
        }
        Some(Command::Kill { uuid }) => {
            client.kill(uuid).await?;
        }
    }
    Ok(())
}

/// One `uuid<TAB>status<TAB>cmd` row per process.
fn write_process_list<W: Write>(out: &mut W, processes: &[ProcessInfo]) -> std::io::Result<()> {
    for process in processes {
        writeln!(out, "{}\t{}\t{}", process.uuid, process.status, process.cmd)?;
    }
    out.flush()
}

/// Header fields, then the buffered log if there is any.
fn write_process<W: Write>(out: &mut W, process: &ProcessInfo) -> std::io::Result<()> {
    writeln!(out, "uuid:   {}", process.uuid)?;
    writeln!(out, "cmd:    {}", process.cmd)?;
    writeln!(out, "status: {}", process.status)?;
    if !process.log.is_empty() {
        writeln!(out, "{}", process.log.trim_end_matches('\n'))?;
    }
    out.flush()
}
