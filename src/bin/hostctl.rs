//! Host coordination CLI

use clap::{Parser, Subcommand};
use hostcoord::common::{format_millis, retry_with_backoff, Config};
use hostcoord::coordinator::{
    hosts, Domain, Host, HostCommand, HostContext, PartitionServerAddress, StaticDomainResolver,
    StoreHost,
};
use hostcoord::monitor::{configured_notifiers, HostMonitor, MemoryNotifier};
use hostcoord::node::{CommandProcessor, MemoryWriterFactory, PartitionedRecordWriter};
use hostcoord::store::{CoordinationStore, MemoryStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// First simulated partition server port
const BASE_PORT: u16 = 12345;
/// Keeps every simulated port within `u16`
const MAX_HOSTS: u16 = 1024;

#[derive(Parser)]
#[command(name = "hostctl")]
#[command(about = "hostcoord host coordination tool", version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run hosts, a coordinator and a monitor against an in-process store
    Simulate {
        /// Number of hosts
        #[arg(
            long,
            default_value = "3",
            value_parser = clap::value_parser!(u16).range(1..=MAX_HOSTS as i64)
        )]
        hosts: u16,

        /// Commands enqueued on every host (comma-separated)
        #[arg(
            long,
            value_delimiter = ',',
            default_value = "execute_update,serve_data"
        )]
        commands: Vec<HostCommand>,

        /// Records written per partition in the simulated build
        #[arg(long, default_value = "100")]
        records: u32,

        /// Print the coordination store tree when done
        #[arg(long)]
        dump: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(Some(path))?,
        None => Config::load(),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Simulate {
            hosts,
            commands,
            records,
            dump,
        } => {
            let store = MemoryStore::new()?;
            simulate(&store, config, hosts, commands, records).await?;
            if dump {
                println!("\n{}", store.dump());
            }
            Ok(())
        }
    }
}

struct SimulatedHost {
    /// Coordinator's handle
    admin: Arc<StoreHost>,
    /// Partition server's handle, on its own session
    node: Arc<StoreHost>,
    session: u64,
    monitor: HostMonitor,
}

async fn simulate(
    store: &MemoryStore,
    config: Config,
    num_hosts: u16,
    commands: Vec<HostCommand>,
    records: u32,
) -> anyhow::Result<()> {
    let domain = Domain::new(0, "users");
    let resolver = Arc::new(StaticDomainResolver::new(vec![domain.clone()]));
    let admin_ctx = HostContext::new(
        store.connect(),
        resolver.clone(),
        config.coordination.clone(),
    );

    let memory_notifier = Arc::new(MemoryNotifier::new());
    let mut notifiers = configured_notifiers(&config.monitor);
    notifiers.push(memory_notifier.clone());

    let mut simulated = Vec::with_capacity(num_hosts as usize);
    for i in 0..num_hosts {
        let address = PartitionServerAddress::new(format!("host-{}", i), BASE_PORT + i);
        let admin = Arc::new(StoreHost::create(&admin_ctx, address.clone(), &[])?);

        let session = store.connect();
        let session_id = session.session_id();
        let node_ctx = HostContext::new(session, resolver.clone(), config.coordination.clone());
        let node = Arc::new(StoreHost::load(&node_ctx, address)?);

        let monitor = HostMonitor::start(
            config.monitor.ring_group.clone(),
            0,
            admin.clone(),
            notifiers.clone(),
        )?;

        admin.add_domain(&domain)?;
        for command in &commands {
            admin.enqueue_command(*command)?;
        }

        simulated.push(SimulatedHost {
            admin,
            node,
            session: session_id,
            monitor,
        });
    }

    // Every partition server drains its queue
    let mut workers = Vec::new();
    for host in &simulated {
        let processor = Arc::new(CommandProcessor::new(host.node.clone()));
        workers.push(tokio::spawn(async move {
            retry_with_backoff(
                || {
                    let processor = processor.clone();
                    async move {
                        tokio::task::spawn_blocking(move || processor.process_pending())
                            .await
                            .map_err(|e| hostcoord::Error::Internal(e.to_string()))?
                    }
                },
                5,
                Duration::from_millis(50),
            )
            .await
        }));
    }
    for worker in workers {
        let executed = worker.await??;
        tracing::debug!("Worker executed {} command(s)", executed);
    }

    // First host reports a build of two partitions
    if let Some(first) = simulated.first() {
        let host_domain = first
            .node
            .host_domain(&domain)?
            .ok_or_else(|| anyhow::anyhow!("{} lost its assignment", domain))?;
        let mut writer =
            PartitionedRecordWriter::new(host_domain.clone(), MemoryWriterFactory::new());
        for partition in 0..2 {
            for n in 0..records {
                let key = format!("key-{}-{}", partition, n);
                writer.write(partition, key.as_bytes(), b"value")?;
            }
        }
        writer.close()?;
        let total = host_domain.total_num_records()?;
        first
            .node
            .set_ephemeral_statistic("build.records", &total.to_string())?;
    }

    print_status(&simulated)?;

    // Lose the first host's session and wait for the monitor to notice
    if let Some(first) = simulated.first() {
        println!("\nExpiring session of {}", first.node.address());
        store.expire_session(first.session);
        if !memory_notifier.wait_for(1, Duration::from_secs(2)).await {
            anyhow::bail!("monitor did not report {} offline", first.node.address());
        }
        for notification in memory_notifier.notifications() {
            println!("notification: {}", notification);
        }
    }

    print_status(&simulated)?;

    for host in &simulated {
        host.monitor.stop();
        host.admin.close()?;
    }
    Ok(())
}

fn print_status(simulated: &[SimulatedHost]) -> anyhow::Result<()> {
    println!(
        "\n{:<20} {:<10} {:<26} {:<16} {:<8} {:<8}",
        "HOST", "STATUS", "UP SINCE", "CURRENT", "DOMAINS", "RECORDS"
    );
    for host in simulated {
        let admin = host.admin.as_ref();
        let current = admin
            .current_command()?
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        let up_since = admin
            .up_since()?
            .map(format_millis)
            .unwrap_or_else(|| "-".to_string());
        let mut records = 0;
        for hd in admin.assigned_domains_sorted()? {
            records += hd.total_num_records()?;
        }
        println!(
            "{:<20} {:<10} {:<26} {:<16} {:<8} {:<8}",
            admin.address().to_string(),
            hosts::status(admin).to_string(),
            up_since,
            current,
            admin.assigned_domains()?.len(),
            records
        );
    }
    Ok(())
}
