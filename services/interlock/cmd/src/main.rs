//! Interlock probe binary.
//!
//! Runs one loopback scenario against the session library: a handshake that
//! must time out, a blocked read that must be interrupted, or an echo round
//! trip in socket or engine mode.

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;
mod probe;

use config::InterlockConfig;
use interlock_wakeup::WakeupKind;
use logging::InterlockLogFormatter;
use probe::{Probe, ProbeMode};

/// Probe for interruptible blocking TLS sessions
#[derive(Parser, Debug)]
#[command(name = "interlock", version, about = "Probe interruptible blocking TLS sessions over loopback")]
struct Args {
    /// Scenario to run
    #[arg(long, value_enum, default_value = "echo")]
    mode: ProbeMode,

    /// Handshake timeout, e.g. 500ms (0s waits forever)
    #[arg(long)]
    timeout: Option<humantime::Duration>,

    /// Read/write timeout for the echo scenario
    #[arg(long)]
    io_timeout: Option<humantime::Duration>,

    /// Delay before the interrupt scenario interrupts the read
    #[arg(long)]
    interrupt_after: Option<humantime::Duration>,

    /// Wakeup channel: auto, pipe, eventfd
    #[arg(long)]
    wakeup: Option<WakeupKind>,

    /// Exchange ciphertext through in-memory buffers instead of a socket
    #[arg(long)]
    engine_mode: bool,

    /// Payload for the echo scenario
    #[arg(long)]
    payload: Option<String>,

    /// ALPN protocol to offer (repeatable)
    #[arg(long)]
    alpn: Vec<String>,

    // TLS options
    /// Path to TLS certificate file (PEM format)
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM format)
    #[arg(long, requires = "tls_ca")]
    tls_key: Option<PathBuf>,

    /// Path to CA certificate file (PEM format)
    #[arg(long, requires = "tls_cert")]
    tls_ca: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Disable coloured log output
    #[arg(long)]
    no_color: bool,

    /// Configuration file path
    #[arg(long, default_value = "interlock.yaml")]
    config: PathBuf,
}

impl Args {
    /// Command-line flags win over file and environment settings
    fn apply_to(&self, config: &mut InterlockConfig) {
        if let Some(timeout) = self.timeout {
            config.handshake_timeout_ms = duration_millis(timeout);
        }
        if let Some(timeout) = self.io_timeout {
            config.io_timeout_ms = duration_millis(timeout);
        }
        if let Some(delay) = self.interrupt_after {
            config.interrupt_after_ms = duration_millis(delay);
        }
        if let Some(kind) = self.wakeup {
            config.session.wakeup = kind;
        }
        if let Some(payload) = &self.payload {
            config.echo_payload = payload.clone();
        }
        if !self.alpn.is_empty() {
            config.session.alpn_protocols = self.alpn.clone();
        }
        if self.tls_cert.is_some() {
            config.tls.cert_file = self.tls_cert.clone();
            config.tls.key_file = self.tls_key.clone();
            config.tls.ca_file = self.tls_ca.clone();
        }
    }
}

fn duration_millis(duration: humantime::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("interlock={}", args.log_level).parse()?)
        .add_directive(format!("tls_interlock={}", args.log_level).parse()?)
        .add_directive(format!("interlock_session={}", args.log_level).parse()?)
        .add_directive(format!("interlock_wakeup={}", args.log_level).parse()?)
        .add_directive(format!("interlock_buffer={}", args.log_level).parse()?);

    let formatter = InterlockLogFormatter::new("interlock".to_string(), !args.no_color);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .event_format(formatter)
        .init();

    info!("Starting interlock probe v{}", env!("CARGO_PKG_VERSION"));

    let mut config = InterlockConfig::load_from_file(&args.config)?;
    args.apply_to(&mut config);

    let probe = Probe::new(config)?;
    let report = probe.run(args.mode, args.engine_mode)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{:?}: {} in {}ms (session {}){}",
            report.mode,
            report.outcome,
            report.elapsed_ms,
            report.session_id,
            report
                .detail
                .as_deref()
                .map(|d| format!(" - {}", d))
                .unwrap_or_default()
        );
    }

    if !report.passed {
        error!("Probe {:?} did not behave as expected: {}", report.mode, report.outcome);
        std::process::exit(1);
    }
    Ok(())
}
