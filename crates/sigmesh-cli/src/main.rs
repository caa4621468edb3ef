//! sigmesh - node graph runtime tools
//!
//! Key generation, stored-record inspection, and an in-process demo graph.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use sigmesh_core::config::{RuntimeConfig, StorageConfig};
use sigmesh_core::context::Context;
use sigmesh_core::crypto::{NodeId, NodeKey};
use sigmesh_core::ext::{ExtKind, ExtensionSlot, ListenerExt, LockableExt};
use sigmesh_core::policy::{Policy, Tree};
use sigmesh_core::signal::{wait_for_response, LockAction, Signal, SignalBody};
use sigmesh_core::store::{NodeRecord, NodeStore};

/// sigmesh - node graph runtime tools
#[derive(Parser, Debug)]
#[command(name = "sigmesh")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log filter (trace, debug, info, warn, error, or a tracing directive
    /// such as "lockable=debug")
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate an Ed25519 node key and print its node id
    Keygen {
        /// Write the secret key (hex) to this file instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Decode and print a persisted node record
    Inspect {
        /// Storage directory of the node records
        store_dir: PathBuf,

        /// Hex node id to inspect
        node_id: String,
    },

    /// Run a small in-process graph and drive a lock/unlock round
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Keygen { out } => keygen(out),
        Commands::Inspect { store_dir, node_id } => inspect(&store_dir, &node_id),
        Commands::Demo => demo().await,
    }
}

fn keygen(out: Option<PathBuf>) -> Result<()> {
    let key = NodeKey::generate();
    println!("node id:    {}", key.node_id());
    println!("public key: {}", hex::encode(key.verifying_key().as_bytes()));

    let secret = hex::encode(key.secret_bytes().as_ref());
    match out {
        Some(path) => {
            write_secret(&path, &secret)?;
            println!("secret key written to {}", path.display());
        }
        None => println!("secret key: {secret}"),
    }
    Ok(())
}

#[cfg(unix)]
fn write_secret(path: &std::path::Path, secret: &str) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("creating {}", path.display()))?;
    file.write_all(secret.as_bytes())?;
    Ok(())
}

#[cfg(not(unix))]
fn write_secret(path: &std::path::Path, secret: &str) -> Result<()> {
    std::fs::write(path, secret).with_context(|| format!("creating {}", path.display()))
}

fn inspect(store_dir: &std::path::Path, node_id: &str) -> Result<()> {
    let id = NodeId::parse(node_id).context("parsing node id")?;
    let store = NodeStore::open(&StorageConfig::Dir(store_dir.to_path_buf()))
        .context("opening store")?;
    let Some(bytes) = store.read(id).context("reading record")? else {
        bail!("no record for node {id}");
    };
    let record = NodeRecord::decode(&bytes).context("decoding record")?;

    println!("node id:   {id}");
    println!("node type: {}", record.node_type);
    println!("record:    {} bytes", bytes.len());
    println!("policies:  {}", record.policies.len());
    for policy in &record.policies {
        println!("  - {}", policy.kind().name());
    }
    println!("extensions: {}", record.extensions.len());
    for (kind, state) in &record.extensions {
        println!(
            "  - {} ({} shape tags, {} state bytes)",
            kind.name(),
            state.type_stack.len(),
            state.data.len()
        );
    }
    Ok(())
}

async fn demo() -> Result<()> {
    const WAIT: Duration = Duration::from_secs(1);

    let ctx = Context::new(RuntimeConfig::default()).context("creating context")?;
    let resource = ctx
        .register_node_type(
            "RESOURCE",
            vec![ExtKind::Listener.ext_type(), ExtKind::Lockable.ext_type()],
        )
        .context("registering node type")?;

    let root_key = NodeKey::generate();
    let root_id = root_key.node_id();
    let child_policy = vec![Policy::PerNode(BTreeMap::from([(root_id, Tree::leaf())]))];

    let mut requirements = Vec::new();
    for _ in 0..3 {
        let (listener, _feed) = ListenerExt::channel(64);
        let req = ctx
            .new_node(
                None,
                resource,
                child_policy.clone(),
                vec![
                    ExtensionSlot::Listener(listener),
                    ExtensionSlot::Lockable(LockableExt::new([])),
                ],
            )
            .context("creating requirement")?;
        println!("requirement {req}");
        requirements.push(req);
    }

    let (listener, mut feed) = ListenerExt::channel(256);
    let root = ctx
        .new_node(
            Some(root_key.clone()),
            resource,
            vec![Policy::AllNodes(Tree::leaf())],
            vec![
                ExtensionSlot::Listener(listener),
                ExtensionSlot::Lockable(LockableExt::new(requirements)),
            ],
        )
        .context("creating root")?;
    println!("root        {root}");

    let lock = ctx
        .send_as(&root_key, root, Signal::lock(LockAction::Lock))
        .context("sending lock")?;
    let (response, seen) = wait_for_response(&mut feed, WAIT, lock)
        .await
        .context("waiting for lock outcome")?;
    for signal in &seen {
        println!("  observed {signal}");
    }
    match &response.body {
        SignalBody::Success { .. } => println!("lock acquired: all requirements held by {root}"),
        other => bail!("lock failed: {other:?}"),
    }

    let unlock = ctx
        .send_as(&root_key, root, Signal::lock(LockAction::Unlock))
        .context("sending unlock")?;
    let (response, _) = wait_for_response(&mut feed, WAIT, unlock)
        .await
        .context("waiting for unlock outcome")?;
    match &response.body {
        SignalBody::Success { .. } => println!("lock released"),
        other => bail!("unlock failed: {other:?}"),
    }
    Ok(())
}
