//! Entry point of the stand-alone signaling server
//!
//! Runs the signaling endpoint with the in-process media engine.

use clap::Parser;
use roomcast_server::{EngineConfig, LocalEngine, ServerConfig, Signaling, serve};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Signaling server for one-to-many media rooms
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address the WebSocket listener binds to
    #[arg(long, default_value = "0.0.0.0:8888", env = "ROOMCAST_LISTEN")]
    listen: SocketAddr,

    /// Request path peers connect on
    #[arg(long, default_value = "/streaming", env = "ROOMCAST_NAMESPACE")]
    namespace: String,

    /// IP the media engine binds transports to
    #[arg(long, default_value = "0.0.0.0", env = "ROOMCAST_LISTEN_IP")]
    listen_ip: IpAddr,

    /// IP advertised in ICE candidates
    #[arg(long, default_value = "127.0.0.1", env = "ROOMCAST_ANNOUNCED_IP")]
    announced_ip: IpAddr,

    /// Lowest RTC port handed to transports
    #[arg(long, default_value_t = 40000, env = "ROOMCAST_RTC_MIN_PORT")]
    rtc_min_port: u16,

    /// Highest RTC port handed to transports
    #[arg(long, default_value_t = 49999, env = "ROOMCAST_RTC_MAX_PORT")]
    rtc_max_port: u16,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            listen: self.listen,
            namespace: self.namespace.clone(),
        }
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            listen_ip: self.listen_ip,
            announced_ip: Some(self.announced_ip),
            rtc_min_port: self.rtc_min_port,
            rtc_max_port: self.rtc_max_port,
            ..EngineConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    if args.rtc_min_port > args.rtc_max_port {
        error!(
            min = args.rtc_min_port,
            max = args.rtc_max_port,
            "Invalid RTC port range"
        );
        return Err("rtc-min-port must not exceed rtc-max-port".into());
    }

    let config = args.server_config();
    let engine = LocalEngine::new(args.engine_config());
    let signaling = Signaling::new(Arc::new(engine));

    let listener = TcpListener::bind(config.listen).await?;
    info!(
        rtc_ports = %format!("{}-{}", args.rtc_min_port, args.rtc_max_port),
        announced_ip = %args.announced_ip,
        "Media engine ready"
    );

    serve(listener, config, signaling, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await?;

    Ok(())
}
