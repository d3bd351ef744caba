//! PhotonWire Server Binary
//!
//! Runs the connection engine with one of the bundled protocols:
//! - `http`: answers every HTTP/1.x request with a small HTML page,
//!   and `/metrics` with the Prometheus exposition
//! - `line`: echoes every newline-terminated line back to its sender
//!
//! # Examples
//!
//! ```bash
//! # HTTP responder on the default address
//! photonwire serve
//!
//! # Line echo with a config file and a different address
//! photonwire serve --config photonwire.toml --bind 0.0.0.0:7000 --protocol line
//!
//! # Print the effective configuration
//! PHOTONWIRE_EVENT_LOOP__IDLE_BACKOFF_MS=5 photonwire config
//! ```

use clap::{Args, Parser, Subcommand, ValueEnum};
use photonwire::error::Error;
use photonwire::framing::{HttpDetector, HttpHeaders, LineDetector};
use photonwire::network::{processor_fn, WriteProxy};
use photonwire::{metrics, EngineConfig, Message, Server};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// PhotonWire - non-blocking message server engine
#[derive(Parser, Debug)]
#[command(name = "photonwire")]
#[command(version = photonwire::VERSION)]
#[command(about = "PhotonWire - non-blocking message server engine", long_about = None)]
#[command(author = "Anton Feldmann <afeldman@lynqtech.com>")]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(long, global = true, env = "PHOTONWIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "PHOTONWIRE_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the server
    Serve(ServeArgs),

    /// Print the effective configuration as TOML
    Config,

    /// Show version
    Version,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Listen address, overrides the configuration
    #[arg(short, long, env = "PHOTONWIRE_BIND")]
    bind: Option<SocketAddr>,

    /// Protocol spoken on accepted connections
    #[arg(short, long, value_enum, default_value_t = Protocol::Http)]
    protocol: Protocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Protocol {
    Http,
    Line,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(ref args) => {
            setup_logging(&cli)?;
            serve_command(cli.config.as_deref(), args)
        }
        Commands::Config => {
            let config = EngineConfig::load(cli.config.as_deref())?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Version => {
            println!("PhotonWire {}", photonwire::VERSION);
            Ok(())
        }
    }
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "photonwire.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(!cli.no_color)
                .pretty(),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

/// Serve command - run until the process is stopped
fn serve_command(config_path: Option<&std::path::Path>, args: &ServeArgs) -> anyhow::Result<()> {
    let mut config = EngineConfig::load(config_path)?;
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }
    info!(version = %photonwire::VERSION, protocol = ?args.protocol, "PhotonWire starting");
    metrics::init_metrics();

    let handle = match args.protocol {
        Protocol::Http => Server::new(
            config,
            HttpDetector::default().factory(),
            processor_fn(http_responder),
        )
        .start()?,
        Protocol::Line => Server::new(
            config,
            LineDetector::default().factory(),
            processor_fn(line_echo),
        )
        .start()?,
    };

    info!(addr = %handle.local_addr(), "Listening");
    handle.wait()?;
    Ok(())
}

const HELLO_PAGE: &[u8] = b"<html><body>Hello World</body></html>";

fn http_responder(
    message: &Message,
    bytes: &[u8],
    writer: &mut WriteProxy<'_>,
) -> photonwire::error::Result<()> {
    let to = message
        .socket_id()
        .ok_or_else(|| Error::Internal("request without socket id".into()))?;
    let uri = message
        .metadata::<HttpHeaders>()
        .and_then(|headers| bytes.get(headers.uri.clone()))
        .unwrap_or(&b"/"[..]);

    let (content_type, body) = if uri == b"/metrics" {
        match metrics::export() {
            Ok(text) => ("text/plain; version=0.0.4", text.into_bytes()),
            Err(e) => {
                warn!(error = %e, "Metrics export failed");
                ("text/plain", b"metrics unavailable".to_vec())
            }
        }
    } else {
        ("text/html", HELLO_PAGE.to_vec())
    };

    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
        content_type,
        body.len()
    );
    let mut response = writer.acquire()?;
    for part in [head.as_bytes(), &body[..]] {
        if let Err(e) = writer.append(&mut response, part) {
            writer.release(response)?;
            return Err(e.into());
        }
    }
    response.set_socket_id(to);
    writer.submit(response)
}

fn line_echo(
    message: &Message,
    bytes: &[u8],
    writer: &mut WriteProxy<'_>,
) -> photonwire::error::Result<()> {
    let to = message
        .socket_id()
        .ok_or_else(|| Error::Internal("line without socket id".into()))?;
    writer.reply(to, bytes)
}
