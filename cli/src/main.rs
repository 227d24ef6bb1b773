use clap::Parser;
use herd_cli::Cli;
use herd_cli::Command;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => herd_cli::serve::run(args).await,
        Command::Config(args) => herd_cli::config_cmd::run(&args),
    }
}

/// Logs go to stderr; stdout carries responses only.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
