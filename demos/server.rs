// ABOUTME: Launcher binary for the cache server with argh-based CLI parsing
// ABOUTME: Binds the listening socket, installs tracing, and runs until Ctrl-C

pub(crate) use argh::FromArgs;
use mcached::server::{self, ServerConfig};

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// memcached-compatible in-memory cache server
#[derive(FromArgs)]
struct CliArgs {
    /// whether or not to enable debug logging
    #[argh(switch, short = 'd')]
    debugging: bool,

    /// the interface to listen on (default: 0.0.0.0)
    #[argh(option)]
    host: Option<String>,

    /// the port to listen on (default: 11211)
    #[argh(option, short = 'p')]
    port: Option<u16>,

    /// the maximum number of concurrently served clients (default: 4)
    // argh would derive `--max-threads`; the flag is spelled with an
    // underscore for drop-in compatibility with existing launch scripts.
    #[argh(option, long = "max_threads")]
    max_threads: Option<usize>,
}

#[tokio::main]
async fn main() -> mcached::Result<()> {
    let cli_args: CliArgs = argh::from_env();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli_args.debugging {
            Level::TRACE
        } else {
            Level::INFO
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let host = cli_args.host.unwrap_or_else(|| server::DEFAULT_HOST.to_owned());
    let port = cli_args.port.unwrap_or(server::DEFAULT_PORT);

    let mut config = ServerConfig::default();
    if let Some(max_threads) = cli_args.max_threads {
        config.max_workers = max_threads;
    }

    // A failed bind exits non-zero through the error return.
    let listener = server::bind(&host, port).map_err(|err| {
        eprintln!("failed to bind {host}:{port}: {err}");
        err
    })?;
    tracing::info!(%host, port, max_workers = config.max_workers, "listening");

    server::run(listener, config, tokio::signal::ctrl_c()).await
}
