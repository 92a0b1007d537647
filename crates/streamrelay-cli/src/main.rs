//! `StreamRelay` CLI
//!
//! Streams a payload (file, stdin, or HTTP URL) into the stdin of the command
//! given after `--`, captures its stdout and stderr, and reports the result.

use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Command, ExitCode};

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use streamrelay_cli::payload::{Payload, PayloadOrigin};
use streamrelay_cli::report::{self, Params, Report};
use streamrelay_core::config::{RelaySettings, load_config};
use streamrelay_core::{DecodeMode, tracing_init};
use streamrelay_engine::{ChildHandle, RelayCancel, RelayConfig, RelayResult, StreamRelay};

#[derive(Parser, Debug)]
#[command(name = "streamrelay")]
#[command(version, about = "Relay a streamed payload into a command's stdin")]
struct Args {
    /// Payload file ("-" for stdin, the default)
    #[arg(short, long, conflicts_with = "url")]
    input: Option<PathBuf>,

    /// Fetch the payload from this URL instead
    #[arg(long, env = "STREAMRELAY_URL")]
    url: Option<String>,

    /// Config file layered over the global settings
    #[arg(long, env = "STREAMRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Abort the relay after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Bytes per payload chunk when reading a file or stdin
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Bytes per read from the command's stdout/stderr
    #[arg(long)]
    read_buffer_size: Option<usize>,

    /// Milliseconds between SIGTERM and SIGKILL when aborting
    #[arg(long)]
    terminate_grace_ms: Option<u64>,

    /// How captured output is decoded
    #[arg(long, value_parser = ["strict", "lossy", "raw"])]
    decode: Option<String>,

    /// Print a JSON report instead of the raw output
    #[arg(long)]
    json: bool,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "warn", env = "STREAMRELAY_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON.
    #[arg(long, env = "STREAMRELAY_LOG_JSON")]
    log_json: bool,

    /// Command to run, after `--`
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

impl Args {
    /// CLI flags are the highest-priority config layer.
    fn apply_to(&self, settings: &mut RelaySettings) -> anyhow::Result<()> {
        if let Some(secs) = self.timeout_secs {
            settings.timeout_secs = Some(secs);
        }
        if let Some(n) = self.chunk_size {
            settings.source_chunk_size = n;
        }
        if let Some(n) = self.read_buffer_size {
            settings.read_buffer_size = n;
        }
        if let Some(ms) = self.terminate_grace_ms {
            settings.terminate_grace_ms = ms;
        }
        if let Some(mode) = &self.decode {
            settings.decode = mode.parse()?;
        }
        settings.validate()?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let log_filter = format!("streamrelay={}", args.log_level);
    tracing_init::init_tracing(&log_filter, args.log_json);

    let mut config = load_config(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply_to(&mut config.relay)?;
    let settings = config.relay;

    let origin = PayloadOrigin::from_args(args.input.as_deref(), args.url.as_deref());
    info!(
        version = env!("CARGO_PKG_VERSION"),
        input = %origin,
        command = ?args.command,
        "Starting streamrelay"
    );

    let payload = Payload::open(&origin, settings.source_chunk_size).await?;

    let (program, program_args) = args
        .command
        .split_first()
        .context("No command given after `--`")?;
    let handle = ChildHandle::spawn(Command::new(program).args(program_args))
        .with_context(|| format!("Failed to start {program}"))?;

    let shutdown = CancellationToken::new();
    let cancel = RelayCancel::new().context("Failed to create cancellation handle")?;
    let _link = cancel.cancel_on(shutdown.clone());
    let signals = spawn_signal_listener(shutdown);

    let result = StreamRelay::relay_async(
        RelayConfig::from(&settings),
        handle,
        payload.source,
        cancel,
    )
    .await
    .context("Relay task failed")?;

    signals.abort();
    if let Some(download) = payload.download {
        download.abort();
    }

    let params = Params {
        command: args.command.clone(),
        input: origin.to_string(),
        content_type: payload.content_type,
    };
    let code = if args.json {
        write_json(&Report::new(params, &result, settings.decode))?;
        report::exit_status(&result)
    } else {
        write_plain(&result, settings.decode)?
    };
    Ok(ExitCode::from(code))
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
fn spawn_signal_listener(shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, cancelling relay"),
            _ = sigterm.recv() => info!("Received SIGTERM, cancelling relay"),
        }
        shutdown.cancel();
    })
}

fn write_json(report: &Report) -> anyhow::Result<()> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, report).context("Failed to write report")?;
    stdout.write_all(b"\n")?;
    stdout.flush()?;
    Ok(())
}

/// Write the captured output and pick the process exit status.
fn write_plain(result: &RelayResult, mode: DecodeMode) -> anyhow::Result<u8> {
    let output = match report::render_plain(result, mode) {
        Ok(output) => output,
        Err(e) => {
            error!(error = %e, "Captured output rejected");
            writeln!(io::stderr(), "streamrelay: {e}")?;
            return Ok(1);
        }
    };

    let mut stdout = io::stdout().lock();
    stdout.write_all(&output)?;
    stdout.flush()?;

    if let Some(err) = &result.error {
        if err.is_cancellation() {
            warn!(error = %err, exit_code = result.exit_code, "Relay stopped early");
        } else {
            error!(error = %err, exit_code = result.exit_code, "Relay failed");
        }
        writeln!(io::stderr(), "streamrelay: {err}")?;
    }
    Ok(report::exit_status(result))
}
