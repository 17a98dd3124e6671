use anyhow::Result;
use clap::Parser;
use kube::Client;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ipvs_operator::engine::Provider;
use ipvs_operator::events;
use ipvs_operator::store::{KubeLoadBalancers, KubeWorkloads};
use ipvs_operator::watch::WatchHub;
use ipvs_operator::ProviderConfig;

#[derive(Parser)]
#[command(name = "ipvs-operator")]
#[command(about = "Kubernetes operator converging LoadBalancer resources onto IPVS directors")]
struct Args {
    /// Kubernetes namespace to watch (empty = all namespaces)
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Director container image
    #[arg(long, env = "PROVIDER_IMAGE")]
    image: String,

    /// Reconcile worker count
    #[arg(long, env = "PROVIDER_WORKERS", default_value_t = 1)]
    workers: usize,

    /// Grace period (seconds) for cascading workload deletion
    #[arg(long, env = "CLEANUP_GRACE_SECONDS", default_value_t = 30)]
    cleanup_grace_seconds: u32,

    /// Health probe bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level.clone())),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_ansi(std::env::var("NO_COLOR").is_err()),
        );
    subscriber.init();

    info!("starting ipvs-operator");
    info!("version: {}", env!("CARGO_PKG_VERSION"));
    info!("watch namespace: {:?}", args.namespace);
    info!("director image: {}", args.image);

    let client = Client::try_default().await?;
    info!("Kubernetes client initialized");

    let hub = WatchHub::spawn(client.clone(), args.namespace.as_deref());

    let cfg = ProviderConfig {
        image: args.image,
        workers: args.workers,
        cleanup_grace_seconds: args.cleanup_grace_seconds,
    };
    let provider = Provider::new(
        cfg,
        Arc::new(KubeLoadBalancers::new(
            client.clone(),
            hub.load_balancers.clone(),
        )),
        Arc::new(KubeWorkloads::new(client, hub.workloads.clone())),
    );

    let handlers = events::spawn_handlers(Arc::clone(&provider), &hub);

    let health_server = tokio::spawn(start_health_server(args.health_addr));

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("received SIGINT, shutting down gracefully...");
            let _ = stop_tx.send(true);
        }
    });

    provider.run(stop_rx).await;

    for handler in handlers {
        handler.abort();
    }
    health_server.abort();

    info!("ipvs-operator shutdown complete");
    Ok(())
}

async fn start_health_server(addr: String) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use std::convert::Infallible;
    use std::net::SocketAddr;

    async fn handle_request(req: Request<Body>) -> Result<Response<Body>, Infallible> {
        match req.uri().path() {
            "/healthz" | "/readyz" => Ok(Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/json")
                .body(Body::from(r#"{"status":"healthy"}"#))
                .unwrap()),
            _ => Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::from("Not Found"))
                .unwrap()),
        }
    }

    let make_svc =
        make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle_request)) });

    let addr: SocketAddr = addr.parse()?;
    let server = Server::bind(&addr).serve(make_svc);

    info!("health server listening on {}", addr);

    if let Err(e) = server.await {
        warn!("health server error: {}", e);
    }

    Ok(())
}
