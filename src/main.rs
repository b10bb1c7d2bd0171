//! CWDTP Echo Server
//!
//! Demo server: admits connections per env config, logs every signal and
//! echoes each application message back to its sender.

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cwdtp::network::auth::{token_verifier, AuthConfig};
use cwdtp::{Accepted, CwdtpServer, ServerConfig, Signal, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("CWDTP echo server v{}", VERSION);

    let mut config = ServerConfig::from_env();
    let auth = AuthConfig::from_env();
    if auth.is_configured() {
        info!("Token verification enabled");
        config.admission.verify_client = Some(token_verifier(auth));
    }
    info!(
        "Path {}, {} per source, {} total",
        config.admission.path,
        config.admission.max_connections_per_source,
        config.admission.max_connections
    );

    let (server, mut accepted) = CwdtpServer::bind(config).await?;
    let server = Arc::new(server);

    tokio::spawn(async move {
        while let Some(connection) = accepted.recv().await {
            tokio::spawn(echo(connection));
        }
    });

    let runner = server.clone();
    let run = tokio::spawn(async move { runner.run().await });

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received");
    server.shutdown();
    run.await??;

    Ok(())
}

/// Echo every message back until the connection ends.
async fn echo(mut connection: Accepted) {
    let source = connection.request.source;
    while let Some(signal) = connection.signals.recv().await {
        match signal {
            Signal::Connected { cid } => info!("{} connected as {}", source, cid),
            Signal::Message { event, data } => {
                if let Err(e) = connection.handle.send(event, data).await {
                    warn!("Echo to {} failed: {}", source, e);
                }
            }
            Signal::Closing => info!("{} closing", source),
            Signal::Closed { error, reason } => {
                info!("{} closed (error: {}): {}", source, error, reason)
            }
            Signal::Error(e) => warn!("{} error: {}", source, e),
            Signal::PingTimeout => warn!("{} ping timeout", source),
            Signal::HandshakeTimeout => warn!("{} handshake timeout", source),
            Signal::CloseTimeout => warn!("{} close timeout", source),
        }
    }
}
