use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use phaser_server::config::ServerConfig;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = ServerConfig::load();
    if let Err(e) = config.validate() {
        tracing::error!("invalid configuration: {e}");
        std::process::exit(1);
    }

    let listener = match TcpListener::bind(&config.listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(addr = %config.listen_addr, "failed to bind: {e}");
            std::process::exit(1);
        },
    };
    tracing::info!(
        addr = %config.listen_addr,
        mode = %config.game.mode,
        "Phaser server listening"
    );

    if let Err(e) = phaser_server::serve(listener, config).await {
        tracing::error!("server error: {e}");
        std::process::exit(1);
    }
}
