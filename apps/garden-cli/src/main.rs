use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;

#[tokio::main]
async fn main() -> ExitCode {
    let parsed = cli::Cli::parse();
    init_logging(parsed.global.log_level.as_deref());

    match commands::execute(parsed).await {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::from(e.exit_code().clamp(0, 255) as u8)
        }
    }
}

/// Filter precedence: `--log-level` / `GARDEN_LOG_LEVEL` (via clap), then
/// `RUST_LOG`, then `info`.
fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
