use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use edgehub_core::{Delta, DeltaKind, Kind, ManagedObject, ObjectKey};
use edgehub_persist::{decode_key, Layout, DEFAULT_MANIFEST_ROOT};
use edgehub_store::start_index;
use edgehub_watcher::WatcherConfig;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "edgectl", version, about = "Inspect the local object mirror of an Edgehub node")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Mirror root directory
    #[arg(long = "root", global = true, env = "EDGEHUB_MANIFEST_ROOT", default_value = DEFAULT_MANIFEST_ROOT)]
    root: PathBuf,

    /// Only show objects in this namespace
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List mirrored objects of a kind
    Ls { kind: Kind },
    /// Print one mirrored object
    Get {
        kind: Kind,
        /// `namespace/name`, or `name` with --ns or for cluster-scoped kinds
        key: String,
    },
    /// Follow the mirror and print +/- lines as objects change
    Watch { kind: Kind },
    /// Decode a mirror file name into its object key
    Key { kind: Kind, file: PathBuf },
}

fn init_tracing() {
    let env = std::env::var("EDGEHUB_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("EDGEHUB_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid EDGEHUB_METRICS_ADDR; expected host:port");
        }
    }
}

fn object_key(kind: Kind, raw: &str, ns: Option<&str>) -> Result<ObjectKey> {
    let key = match (raw.contains('/'), ns) {
        (false, Some(ns)) => ObjectKey::for_kind(kind, Some(ns), raw),
        _ => ObjectKey::from_str(raw).map(|k| ObjectKey::for_kind(kind, k.namespace.as_deref(), &k.name))?,
    };
    if kind.namespaced() && key.namespace.is_none() {
        return Err(anyhow!("{} is namespaced; use namespace/name or --ns", kind));
    }
    Ok(key)
}

fn file_name_of(path: &Path) -> Result<&str> {
    path.file_name().and_then(|n| n.to_str()).ok_or_else(|| anyhow!("{} has no usable file name", path.display()))
}

fn delta_line(d: &Delta) -> String {
    let sign = match d.change {
        DeltaKind::Applied => '+',
        DeltaKind::Deleted => '-',
    };
    format!("{} {}", sign, d.key)
}

fn in_namespace(obj: &ManagedObject, ns: Option<&str>) -> bool {
    ns.map_or(true, |n| obj.meta().namespace.as_deref() == Some(n))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let layout = Layout::new(&cli.root);
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Ls { kind } => {
            info!(kind = %kind, root = %cli.root.display(), "ls invoked");
            let store = layout.open(kind).with_context(|| format!("opening {} mirror", kind))?;
            let index = start_index(store, WatcherConfig { watch: false, relist_interval: None, ..Default::default() });
            tokio::time::timeout(Duration::from_secs(10), index.wait_synced()).await.context("waiting for the first listing")?;
            let items: Vec<(ObjectKey, ManagedObject)> =
                index.current().objects().into_iter().filter(|(_, o)| in_namespace(o, ns)).collect();
            match cli.output {
                Output::Human => {
                    println!("{:<20} {:<40} {}", "NAMESPACE", "NAME", "RESOURCE VERSION");
                    for (key, obj) in &items {
                        let rv = obj.meta().resource_version.as_deref().unwrap_or("-");
                        println!("{:<20} {:<40} {}", key.namespace.as_deref().unwrap_or("-"), key.name, rv);
                    }
                }
                Output::Json => {
                    let objects: Vec<&ManagedObject> = items.iter().map(|(_, o)| o).collect();
                    println!("{}", serde_json::to_string_pretty(&objects)?);
                }
            }
        }
        Commands::Get { kind, key } => {
            let key = object_key(kind, &key, ns)?;
            let store = layout.open(kind)?;
            let obj = store.load(&key)?.ok_or_else(|| anyhow!("{} {} not found in {}", kind, key, store.dir().display()))?;
            match cli.output {
                Output::Human => print!("{}", serde_yaml::to_string(&obj)?),
                Output::Json => println!("{}", serde_json::to_string_pretty(&obj)?),
            }
        }
        Commands::Watch { kind } => {
            info!(kind = %kind, root = %cli.root.display(), "watch invoked");
            let store = layout.open(kind)?;
            let index = start_index(store, WatcherConfig::default());
            let (tx, mut rx) = mpsc::unbounded_channel::<Delta>();
            index.on_change(move |d| {
                let _ = tx.send(d.clone());
            });
            loop {
                tokio::select! {
                    maybe = rx.recv() => {
                        let Some(d) = maybe else { break };
                        if !in_namespace(&d.object, ns) {
                            continue;
                        }
                        match cli.output {
                            Output::Human => println!("{}", delta_line(&d)),
                            Output::Json => println!("{}", serde_json::json!({
                                "change": d.change,
                                "key": d.key,
                                "object": d.object,
                            })),
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; stopping watch");
                        break;
                    }
                }
            }
        }
        Commands::Key { kind, file } => {
            let key = decode_key(kind, file_name_of(&file)?)?;
            match cli.output {
                Output::Human => println!("{}", key),
                Output::Json => println!("{}", serde_json::to_string(&key)?),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_from_arguments() {
        assert_eq!(object_key(Kind::Pod, "ns/x", None).unwrap(), ObjectKey::namespaced("ns", "x"));
        assert_eq!(object_key(Kind::Pod, "x", Some("ns")).unwrap(), ObjectKey::namespaced("ns", "x"));
        assert_eq!(object_key(Kind::Node, "edge-1", Some("ns")).unwrap(), ObjectKey::cluster("edge-1"));
        assert!(object_key(Kind::Pod, "x", None).is_err());
    }

    #[test]
    fn file_names_and_lines() {
        assert_eq!(file_name_of(Path::new("/etc/kubernetes/mqttManifests/pods/ns#x.yaml")).unwrap(), "ns#x.yaml");
        let d = Delta {
            kind: Kind::Node,
            key: ObjectKey::cluster("edge-1"),
            change: DeltaKind::Deleted,
            object: serde_yaml::from_str("apiVersion: v1\nkind: Node\nmetadata:\n  name: edge-1\n").unwrap(),
        };
        assert_eq!(delta_line(&d), "- edge-1");
    }
}
