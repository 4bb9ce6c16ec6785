//! Lumina runtime binary: load config, start the core services, and serve
//! the WebSocket gateway until interrupted.

mod logging;

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "lumina")]
#[command(about = "Lumina — personal AI companion runtime")]
struct Args {
    /// Config file path (default: lumina.toml in the working dir, then the
    /// user config dir)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Bind host (overrides config)
    #[arg(long, value_name = "HOST")]
    host: Option<String>,

    /// Bind port (overrides config)
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Data directory (overrides config)
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = config::apply_dotenv(None) {
        eprintln!("warning: .env load failed: {e}");
    }
    logging::init();

    let mut settings = match config::load(args.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            // Config errors are fatal at startup.
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };
    if let Some(host) = args.host {
        settings.server.host = host;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    if let Some(data_dir) = args.data_dir {
        settings.data.data_dir = data_dir;
    }

    let addr: std::net::SocketAddr =
        match format!("{}:{}", settings.server.host, settings.server.port).parse() {
            Ok(addr) => addr,
            Err(e) => {
                eprintln!("fatal: invalid bind address: {e}");
                std::process::exit(1);
            }
        };

    let services = match lumina::Lifecycle::start(settings).await {
        Ok(services) => services,
        Err(e) => {
            error!(error = %e, "startup failed");
            std::process::exit(1);
        }
    };

    let state = gateway::GatewayState::new(services.bus.clone());
    let server = tokio::spawn(gateway::serve(state, addr));

    info!(addr = %addr, "lumina is up; press ctrl-c to stop");
    let _ = tokio::signal::ctrl_c().await;

    server.abort();
    lumina::Lifecycle::shutdown(&services).await;
}
