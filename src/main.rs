//! # komodo
//!
//! Komodo relay binary: loads settings, installs logging and serves the
//! relay until ctrl-c.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use komodo_settings::{CaptureFormat, RelaySettings};
use komodo_store::{AuditSink, NoopAudit, SqliteAuditLog};
use komodo_telemetry::{init_telemetry, TelemetryConfig};

/// Komodo session relay.
#[derive(Parser, Debug)]
#[command(name = "komodo", about = "Session relay for multi-user VR/AR applications")]
struct Cli {
    /// Settings file (defaults to `~/.komodo/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Directory captures are written to.
    #[arg(long)]
    capture_dir: Option<PathBuf>,

    /// Capture encoding: `records` or `binary`.
    #[arg(long, value_parser = parse_format)]
    capture_format: Option<CaptureFormat>,

    /// Write connection and capture events to this `SQLite` database.
    #[arg(long)]
    audit_db: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON.
    #[arg(long)]
    json: bool,
}

fn parse_format(raw: &str) -> Result<CaptureFormat, String> {
    CaptureFormat::parse(raw).ok_or_else(|| format!("unknown capture format: {raw}"))
}

impl Cli {
    fn apply(self, settings: &mut RelaySettings) {
        if let Some(host) = self.host {
            settings.server.host = host;
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(dir) = self.capture_dir {
            settings.capture.path = dir;
        }
        if let Some(format) = self.capture_format {
            settings.capture.format = format;
        }
        if let Some(db) = self.audit_db {
            settings.audit.enabled = true;
            settings.audit.db_path = db;
        }
        if let Some(level) = self.log_level {
            settings.logging.level = level;
        }
        if self.json {
            settings.logging.json = true;
        }
    }
}

fn load(cli: &Cli) -> Result<RelaySettings> {
    match &cli.settings {
        Some(path) => komodo_settings::load_settings_from_path(path)
            .with_context(|| format!("Failed to load settings from {}", path.display())),
        None => komodo_settings::load_settings().context("Failed to load settings"),
    }
}

fn open_audit(settings: &RelaySettings) -> Result<Arc<dyn AuditSink>> {
    if !settings.audit.enabled {
        return Ok(Arc::new(NoopAudit));
    }
    let log = SqliteAuditLog::open(&settings.audit.db_path).with_context(|| {
        format!("Failed to open audit database: {}", settings.audit.db_path.display())
    })?;
    tracing::info!(path = %settings.audit.db_path.display(), "audit log opened");
    Ok(Arc::new(log))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = load(&cli)?;
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;

    let _ = init_telemetry(TelemetryConfig::from_level(
        &settings.logging.level,
        settings.logging.json,
    ));

    let audit = open_audit(&settings)?;
    let handle = komodo_server::start(settings, audit)
        .await
        .context("Failed to start server")?;
    tracing::info!(addr = %handle.addr, "komodo relay ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;

    handle.shutdown().await;
    Ok(())
}
