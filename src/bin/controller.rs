//! Node Cache Controller
//!
//! The cluster reconciler. Watches nodes and claims, maintains the volume
//! type map, and provisions + attaches one persistent disk per pd-labeled
//! node. Runs until a watch loop fails; process managers restart it.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use node_cache::{Attacher, Controller, ControllerConfig, GceAttacher};

/// Node Cache Controller - cluster reconciler for shared cache volumes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Namespace for the volume type map and per-node claims
    #[arg(long, env = "NAMESPACE")]
    namespace: String,

    /// The name of the volume type config map, found in --namespace
    #[arg(long)]
    volume_type_map: String,

    /// The storage class to use for the PD cache type. If empty, PD caches
    /// cannot be used
    #[arg(long, default_value = "")]
    pd_storage_class: String,

    /// Health endpoint bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args);

    let client = match kube::Client::try_default().await {
        Ok(client) => client,
        Err(e) => {
            error!("could not create Kubernetes client: {}", e);
            std::process::exit(1);
        }
    };

    let pd_storage_class = Some(args.pd_storage_class.clone()).filter(|s| !s.is_empty());
    let attacher: Option<Arc<dyn Attacher>> = pd_storage_class
        .as_ref()
        .map(|_| Arc::new(GceAttacher::new(client.clone())) as Arc<dyn Attacher>);

    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("health server error: {}", e);
        }
    });

    let config = ControllerConfig {
        namespace: args.namespace,
        volume_type_map: args.volume_type_map,
        pd_storage_class,
    };
    info!("starting controller v{}", node_cache::VERSION);

    let controller = Controller::new(client, config, attacher);
    match controller.run().await {
        Ok(()) => error!("controller exited unexpectedly"),
        Err(e) => error!("unexpected controller exit: {}", e),
    }
    std::process::exit(1);
}

async fn run_health_server(addr: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/readyz" => Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::from("ok"))
                    .unwrap(),
                _ => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from("not found"))
                    .unwrap(),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse()?;
    info!("health server listening on {}", addr);
    Server::bind(&addr).serve(make_svc).await?;
    Ok(())
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("tower=warn".parse().unwrap())
        .add_directive("kube=info".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
