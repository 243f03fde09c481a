//! Node Cache Driver
//!
//! The per-node CSI plug-in. Serves identity and node RPCs on the given
//! endpoint and materializes this node's cache volume on first publish.

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use node_cache::Driver;

/// Node Cache Driver - per-node CSI plug-in for shared cache volumes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// CSI endpoint
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:/tmp/csi.sock")]
    endpoint: String,

    /// The node name, probably the pod's spec.nodeName
    #[arg(long, env = "NODE_NAME")]
    node_name: String,

    /// The namespace of the driver and the volume type map
    #[arg(long, env = "NAMESPACE")]
    namespace: String,

    /// The name of the volume type config map written by the controller
    #[arg(long)]
    volume_type_map: String,

    /// The driver name as advertised in plug-in info
    #[arg(long)]
    driver_name: String,

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

    info!(
        "creating driver {} v{} on {}",
        args.driver_name,
        node_cache::VERSION,
        args.node_name
    );
    let driver = Driver::new(
        client,
        args.endpoint,
        args.node_name,
        args.namespace,
        args.volume_type_map,
        args.driver_name,
    );

    match driver.run().await {
        Ok(()) => error!("server exited unexpectedly"),
        Err(e) => error!("driver or server unexpectedly exited: {}", e),
    }
    std::process::exit(1);
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
