//! resterm-stream - run one WebSocket or SSE stream and print its transcript
//!
//! Logs go to a file so stdout carries only the response.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use resterm_stream::constants::{APP_NAME, APP_VERSION, LOG_FILE};
use resterm_stream::{
    execute_sse, execute_websocket, SseRequest, StreamResponse, StreamSettings, WebSocketRequest,
    WebSocketStep,
};

#[derive(Parser, Debug)]
#[command(name = APP_NAME, version = APP_VERSION, about = "Record a WebSocket or SSE stream")]
struct Cli {
    /// Log filter written to the log file (e.g. `debug`, `resterm_stream=trace`)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Settings file (defaults to ~/.resterm/streams.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Extra request header, `Name: value`
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Idle timeout in ms (0 disables)
    #[arg(long)]
    idle_ms: Option<u64>,

    /// Total timeout in ms (0 disables)
    #[arg(long)]
    total_ms: Option<u64>,

    /// Accept invalid TLS certificates
    #[arg(long)]
    insecure: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open a WebSocket, run steps and close
    Ws {
        url: String,
        /// Text message to send, repeatable; runs after --steps
        #[arg(long = "text")]
        texts: Vec<String>,
        /// YAML file with a list of steps
        #[arg(long)]
        steps: Option<PathBuf>,
        /// Sub-protocol to offer, repeatable
        #[arg(long = "subprotocol")]
        subprotocols: Vec<String>,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Read a Server-Sent Events stream
    Sse {
        url: String,
        /// Stop after this many body bytes
        #[arg(long)]
        max_bytes: Option<u64>,
        /// Stop after this many events
        #[arg(long)]
        max_events: Option<u64>,
        #[command(flatten)]
        common: CommonArgs,
    },
}

fn parse_header(raw: &str) -> Result<(String, String)> {
    match raw.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => bail!("invalid header {:?}, expected `Name: value`", raw),
    }
}

fn apply_common(settings: &mut StreamSettings, common: &CommonArgs) -> Result<Vec<(String, String)>> {
    if common.insecure {
        settings.dial.insecure = true;
    }
    common.headers.iter().map(|raw| parse_header(raw)).collect()
}

fn load_steps(path: &Path) -> Result<Vec<WebSocketStep>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

fn print_response(response: &StreamResponse) {
    println!("{} {}", response.status, response.status_text);
    for (name, value) in &response.headers {
        println!("{}: {}", name, value);
    }
    println!();
    println!("{}", response.pretty_body());
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging to file
    let file_appender = tracing_appender::rolling::never(".", LOG_FILE);
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::try_new(&cli.log_level)?)
        .init();

    let mut settings = match &cli.config {
        Some(path) => StreamSettings::load_from(path)?,
        None => StreamSettings::load()?,
    };

    let response = match cli.command {
        Command::Ws {
            url,
            texts,
            steps,
            subprotocols,
            common,
        } => {
            let headers = apply_common(&mut settings, &common)?;
            let options = &mut settings.websocket;
            if let Some(ms) = common.idle_ms {
                options.idle_timeout = Duration::from_millis(ms);
            }
            if let Some(ms) = common.total_ms {
                options.total_timeout = Duration::from_millis(ms);
            }
            options.subprotocols.extend(subprotocols);

            let mut script = Vec::new();
            if let Some(path) = &steps {
                script = load_steps(path)?;
                if settings.dial.base_dir.is_none() {
                    settings.dial.base_dir = path.parent().map(PathBuf::from);
                }
            }
            script.extend(texts.into_iter().map(|value| WebSocketStep::SendText { value }));

            let request = WebSocketRequest { url, headers };
            tracing::info!(url = %request.url, steps = script.len(), "Starting WebSocket stream");
            execute_websocket(&request, &script, &settings.websocket, &settings.dial).await?
        }
        Command::Sse {
            url,
            max_bytes,
            max_events,
            common,
        } => {
            let headers = apply_common(&mut settings, &common)?;
            let options = &mut settings.sse;
            if let Some(ms) = common.idle_ms {
                options.idle_timeout = Duration::from_millis(ms);
            }
            if let Some(ms) = common.total_ms {
                options.total_timeout = Duration::from_millis(ms);
            }
            if let Some(max) = max_bytes {
                options.max_bytes = max;
            }
            if let Some(max) = max_events {
                options.max_events = max;
            }

            let mut request = SseRequest::get(url);
            request.headers = headers;
            tracing::info!(url = %request.url, "Starting SSE stream");
            execute_sse(&request, &settings.sse, &settings.dial).await?
        }
    };

    print_response(&response);
    Ok(())
}
