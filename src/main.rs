use std::{path::PathBuf, sync::Arc};

use pathproxy_core::forward::{ForwarderOptions, HttpsForwarder};
use pathproxy_core::server::{Server, load_tls_acceptor};
use pathproxy_core::service::Dispatcher;
use pathproxy_core::target::RoutePrefix;
use tracing::{Instrument as _, debug, error, info, info_span, instrument};

use crate::config::Config;

mod config;
mod logging;

#[tokio::main]
async fn main() {
    if let Err(e) = logging::init_logging_from_env("info") {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let server = match start(config_path)
        .instrument(info_span!("pathproxy_startup"))
        .await
    {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start: {:#}", e);
            std::process::exit(1);
        }
    };

    run_server(server).await;
}

async fn start(config_path: Option<PathBuf>) -> anyhow::Result<Server> {
    info!("Starting pathproxy");

    let config = match config_path {
        Some(path) => {
            info!("Loading config from {}", path.display());
            Config::load(&path)?
        }
        None => {
            info!("No config file given, using defaults");
            Config::default()
        }
    };
    debug!("Effective config: {:?}", config);

    let route_prefix = RoutePrefix::new(config.route_prefix)?;
    let forwarder = HttpsForwarder::new(&ForwarderOptions::from(&config.upstream))?;
    let dispatcher = Arc::new(Dispatcher::new(route_prefix, Arc::new(forwarder)));

    let tls_acceptor = match &config.ssl {
        Some(ssl) => Some(load_tls_acceptor(&ssl.certificate, &ssl.private_key)?),
        None => None,
    };

    let server = Server::new(config.listen, dispatcher, tls_acceptor).await?;
    info!("Listening on {}", server.local_addr()?);
    Ok(server)
}

#[instrument(skip(server))]
async fn run_server(server: Server) {
    loop {
        match server.accept().await {
            Ok(_) => debug!("Accepted new connection"),
            Err(e) => error!("Failed to accept connection: {}", e),
        }
    }
}
