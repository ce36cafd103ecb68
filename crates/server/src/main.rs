use clap::Parser;
use starhold_server::ServerConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Starhold game server: action API plus job workers", long_about = None)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:39444")]
    addr: SocketAddr,

    /// SQLite database path (default: ~/.starhold/starhold.db).
    #[arg(long)]
    db: Option<PathBuf>,

    /// Ruleset YAML; the compiled-in default is used when omitted.
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Number of job worker tasks.
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Idle worker poll interval in milliseconds.
    #[arg(long, default_value_t = 250)]
    poll_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let db_path = args.db.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".starhold")
            .join("starhold.db")
    });
    let config = ServerConfig {
        db_path,
        rules_path: args.rules,
        workers: args.workers,
        poll_interval: Duration::from_millis(args.poll_ms),
    };
    starhold_server::serve(args.addr, config).await
}
