mod config;
mod controller;
mod informer;
mod nodes;
mod queue;
mod registry;
mod store;
mod writer;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use controller::{Controller, ControllerOptions, PoolMemberType};
use informer::KubeClusterSource;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use writer::FileConfigWriter;

use crate::registry::ALL_NAMESPACES;

#[derive(Parser)]
#[clap(about, version)]
struct Opts {
    /// Namespace to watch; repeatable. Watches all namespaces when absent.
    #[arg(long = "namespace")]
    namespaces: Vec<String>,
    /// Watch namespaces matching this label selector instead of a fixed list.
    #[arg(long, conflicts_with = "namespaces")]
    namespace_label: Option<String>,
    /// Pool-member derivation mode: "nodeport" or "cluster".
    #[arg(long, default_value = "nodeport")]
    pool_member_type: String,
    /// Use node InternalIP addresses for NodePort pool members.
    #[arg(long)]
    use_node_internal: bool,
    /// Label selector for virtual-server ConfigMaps.
    #[arg(long, default_value = config::DEFAULT_CONFIGMAP_SELECTOR)]
    configmap_label: String,
    /// Seconds between node list polls.
    #[arg(long, default_value_t = 30)]
    node_poll_interval: u64,
    /// Seconds between full ConfigMap re-deliveries; 0 disables resync.
    #[arg(long, default_value_t = 30 * 60)]
    resync_interval: u64,
    /// Path of the JSON document handed to the load-balancer agent.
    #[arg(long, default_value = "/tmp/bigip-virtual-servers.json")]
    output_file: PathBuf,
    /// Increase log verbosity; repeatable. RUST_LOG still takes precedence.
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    let default_level = match opts.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let pool_member_type: PoolMemberType = opts.pool_member_type.parse()?;
    let resync_period = (opts.resync_interval > 0).then(|| Duration::from_secs(opts.resync_interval));

    let client = kube::Client::try_default().await?;
    let cluster = Arc::new(KubeClusterSource::new(client.clone()));
    let writer = Arc::new(FileConfigWriter::spawn(opts.output_file.clone()));
    let controller = Controller::new(
        cluster,
        writer,
        ControllerOptions {
            pool_member_type,
            use_node_internal: opts.use_node_internal,
            resync_period,
        },
    );

    if let Some(label) = &opts.namespace_label {
        controller.watch_namespaces(label)?;
        info!(selector = %label, "watching namespaces by label");
    } else if opts.namespaces.is_empty() {
        controller.add_namespace(ALL_NAMESPACES, &opts.configmap_label, resync_period)?;
        info!("watching all namespaces");
    } else {
        for namespace in &opts.namespaces {
            controller.add_namespace(namespace, &opts.configmap_label, resync_period)?;
            info!(namespace = %namespace, "watching namespace");
        }
    }

    spawn_node_poller(
        &controller,
        Api::all(client),
        Duration::from_secs(opts.node_poll_interval),
    );

    let runner = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.run().await })
    };

    tokio::signal::ctrl_c().await?;
    info!("received shutdown signal");
    controller.shutdown();
    runner.await?;
    Ok(())
}

/// Feeds node snapshots into the controller on a fixed interval.
fn spawn_node_poller(controller: &Controller, node_api: Api<Node>, period: Duration) {
    let controller = controller.clone();
    let stop = controller.stop_token();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tick.tick() => match node_api.list(&ListParams::default()).await {
                    Ok(nodes) => controller.process_node_update(&nodes.items).await,
                    Err(err) => warn!(error = %err, "node list failed"),
                },
            }
        }
    });
}
