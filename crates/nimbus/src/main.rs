use clap::{Parser, Subcommand};
use ipnet::Ipv4Net;
use nimbus_core::NetworkConfig;
use nimbus_network::{
    policy_for, CreateNetworksSpec, InProcessBus, MockDriver, NetworkHost, PolicyKind, StaticQuota,
};
use nimbus_storage::{MemoryStore, Store};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "nimbus", about = "Nimbus Network Host Manager")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Shared topology arguments for both subcommands.
#[derive(clap::Args, Clone, Debug)]
struct PolicyArgs {
    /// Topology policy: flat, flat-dhcp or vlan
    #[arg(long, default_value = "flat-dhcp")]
    mode: String,

    /// Identity of this network host
    #[arg(long, default_value = "localhost")]
    host_id: String,

    /// Skip driver dhcp/ra side effects
    #[arg(long, default_value_t = false)]
    fake_network: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Administer networks and address pools
    Network {
        #[command(subcommand)]
        command: NetworkCommands,
    },
    /// Run a network host service loop
    Host {
        #[command(flatten)]
        policy_args: PolicyArgs,
        /// Seconds between periodic task ticks
        #[arg(long, default_value_t = 10)]
        periodic_interval: u64,
    },
}

#[derive(Subcommand)]
enum NetworkCommands {
    /// Carve networks out of a parent block and materialize their pools
    Create {
        /// Parent CIDR block (e.g. 192.168.0.0/24)
        cidr: Ipv4Net,
        /// How many networks to carve
        num_networks: u32,
        /// Addresses per network (power of two)
        network_size: u32,
        /// Network label; suffixed with the index when creating several
        #[arg(long, default_value = "private")]
        label: String,
        /// Bridge device name (vlan mode derives its own)
        #[arg(long, default_value = "br100")]
        bridge: String,
        /// Interface the bridge enslaves
        #[arg(long)]
        bridge_interface: Option<String>,
        /// Every compute host runs its own dhcp/bridge
        #[arg(long, default_value_t = false)]
        multi_host: bool,
        /// First vlan tag (vlan mode)
        #[arg(long)]
        vlan_start: Option<u16>,
        /// First vpn port (vlan mode)
        #[arg(long)]
        vpn_start: Option<u16>,
        /// Derive v6 subnets alongside the v4 ones
        #[arg(long, default_value_t = false)]
        use_ipv6: bool,
        #[command(flatten)]
        policy_args: PolicyArgs,
    },
    /// Seed the floating ip pool from a range
    CreateFloating {
        /// Floating CIDR block (e.g. 4.4.4.0/24)
        range: Ipv4Net,
        #[command(flatten)]
        policy_args: PolicyArgs,
    },
}

fn build_host(
    policy_args: &PolicyArgs,
    mutate: impl FnOnce(&mut NetworkConfig),
) -> miette::Result<(Arc<NetworkHost>, Arc<MemoryStore>, Arc<InProcessBus>)> {
    let kind: PolicyKind = policy_args
        .mode
        .parse()
        .map_err(|e: String| miette::miette!(help = "Pass --mode flat, flat-dhcp or vlan", "{e}"))?;

    let mut config = NetworkConfig::for_host(policy_args.host_id.clone());
    config.fake_network = policy_args.fake_network;
    mutate(&mut config);

    let store = Arc::new(MemoryStore::new());
    let driver = Arc::new(MockDriver::new());
    let bus = Arc::new(InProcessBus::new());
    let quota = Arc::new(StaticQuota::new(store.clone(), config.floating_ip_quota));
    let policy = policy_for(kind, &config);
    let host = Arc::new(NetworkHost::new(
        store.clone(),
        driver,
        bus.clone(),
        quota,
        policy,
        config,
    ));
    Ok((host, store, bus))
}

async fn run_network_create(
    spec: CreateNetworksSpec,
    use_ipv6: bool,
    policy_args: &PolicyArgs,
) -> miette::Result<()> {
    let (host, _store, _bus) = build_host(policy_args, |config| {
        config.use_ipv6 = use_ipv6;
    })?;
    let networks = host
        .create_networks(&spec)
        .await
        .map_err(|e| miette::Report::new(e))?;
    for network in &networks {
        println!(
            "created network {} ({}) gateway {} bridge {}",
            network.label, network.cidr, network.gateway, network.bridge
        );
    }
    Ok(())
}

async fn run_floating_create(range: Ipv4Net, policy_args: &PolicyArgs) -> miette::Result<()> {
    let (_host, store, _bus) = build_host(policy_args, |_| {})?;
    let mut count = 0usize;
    for address in range.hosts() {
        store
            .floating_ip_create(address)
            .await
            .map_err(|e| miette::Report::new(e))?;
        count += 1;
    }
    println!("seeded {} floating ip(s) from {}", count, range);
    Ok(())
}

async fn run_host_service(policy_args: &PolicyArgs, periodic_interval: u64) -> miette::Result<()> {
    let (host, store, bus) = build_host(policy_args, |config| {
        config.periodic_interval = Duration::from_secs(periodic_interval);
    })?;
    // the reference deployment answers dhcp on the loopback host
    store
        .register_host_ip(policy_args.host_id.clone(), Ipv4Addr::new(127, 0, 0, 1))
        .await;

    host.attach_to_bus(&bus)
        .await
        .map_err(|e| miette::Report::new(e))?;
    host.init_host().await.map_err(|e| miette::Report::new(e))?;

    let token = CancellationToken::new();
    let run_token = token.clone();
    let runner = {
        let host = Arc::clone(&host);
        tokio::spawn(async move { host.run(run_token).await })
    };

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette::miette!("failed to wait for ctrl-c: {e}"))?;
    info!("interrupt received, shutting down");
    token.cancel();
    runner
        .await
        .map_err(|e| miette::miette!("periodic task panicked: {e}"))?
        .map_err(|e| miette::Report::new(e))?;
    Ok(())
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Network { command } => match command {
            NetworkCommands::Create {
                cidr,
                num_networks,
                network_size,
                label,
                bridge,
                bridge_interface,
                multi_host,
                vlan_start,
                vpn_start,
                use_ipv6,
                policy_args,
            } => {
                let spec = CreateNetworksSpec {
                    bridge,
                    bridge_interface,
                    multi_host,
                    vlan_start,
                    vpn_start,
                    ..CreateNetworksSpec::new(label, cidr, num_networks, network_size)
                };
                run_network_create(spec, use_ipv6, &policy_args).await
            }
            NetworkCommands::CreateFloating { range, policy_args } => {
                run_floating_create(range, &policy_args).await
            }
        },
        Commands::Host {
            policy_args,
            periodic_interval,
        } => run_host_service(&policy_args, periodic_interval).await,
    }
}
