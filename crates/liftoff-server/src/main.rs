use clap::Parser;
use liftoff_server::Store;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "liftoff-server", about = "Liftoff state API v1 server")]
struct Cli {
    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 8321)]
    port: u16,

    /// Directory holding records, locks and engine state, one subdirectory per account.
    #[arg(long, default_value = "./liftoff-state")]
    data_dir: PathBuf,

    /// Bearer token clients must present. Falls back to LIFTOFF_SERVER_TOKEN.
    #[arg(long)]
    auth_token: Option<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("LIFTOFF_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = fs::create_dir_all(&cli.data_dir) {
        error!("failed to create data directory {}: {e}", cli.data_dir.display());
        return ExitCode::FAILURE;
    }

    let addr = format!("{}:{}", cli.bind, cli.port);
    info!("data directory: {}", cli.data_dir.display());

    let mut store = Store::new(cli.data_dir);
    match cli
        .auth_token
        .or_else(|| std::env::var("LIFTOFF_SERVER_TOKEN").ok())
    {
        Some(token) if !token.is_empty() => store = store.with_auth_token(token),
        _ => info!("authentication disabled"),
    }

    match liftoff_server::run_server(&Arc::new(store), &addr) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
