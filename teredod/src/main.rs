//! The Teredo daemon: tunnels IPv6 over IPv4/UDP through NATs (RFC 4380) as
//! a client, relay or server.

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod netcfg;
mod platform;
mod sockets;
mod tun;

use anyhow::{bail, Context as _, Result};
use clap::Parser;
use netcfg::{LogConfigurator, NetConfigurator};
use sockets::UdpEndpoint;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use teredo_proto::{is_valid_teredo_prefix, router_solicitation, TEREDO_PORT};
use teredo_tunnel::{
    eligible_interfaces, Clock, Discovery, DiscoveryConfig, Maintenance, MaintenanceConfig, Relay,
    RelayConfig, ServerState, ServerTx, TeredoState, TokenKeys, Transmit,
};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tun::TunDevice;

const MAX_UDP_SIZE: usize = 65536;

/// Default UDP port for the client and relay roles. A fixed, distinctive
/// port is friendlier to firewalls than a random one.
const CLIENT_PORT: u16 = 3545;

#[derive(Parser)]
#[command(author, version, about = "Teredo tunnel endpoint (RFC 4380)", long_about = None)]
struct Cli {
    /// Operating role.
    #[arg(long, value_enum, env = "TEREDOD_ROLE", default_value_t = Role::Client)]
    role: Role,

    /// Teredo server: the one to qualify through (client role) or the name
    /// of our own primary address (server role).
    #[arg(long, env = "TEREDOD_SERVER")]
    server: Option<String>,

    /// IPv4 address to bind the UDP endpoint to.
    #[arg(long, env = "TEREDOD_BIND_ADDRESS", default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_address: Ipv4Addr,

    /// UDP port to bind; 0 picks the role default (3545, servers 3544).
    #[arg(long, env = "TEREDOD_PORT", default_value_t = 0)]
    port: u16,

    /// Name of the IPv6 tunnel interface.
    #[arg(long, env = "TEREDOD_IFNAME", default_value = "teredo")]
    ifname: String,

    /// Teredo prefix to announce (server role) or relay for.
    #[arg(long, env = "TEREDOD_PREFIX", default_value = "2001:0:0:0:0:0:0:0")]
    prefix: Ipv6Addr,

    /// Tunnel MTU.
    #[arg(long, env = "TEREDOD_MTU", default_value_t = 1280)]
    mtu: u16,

    /// Announce and accept peers on the local link (client role).
    #[arg(long, env = "TEREDOD_DISCOVERY", default_value_t = false)]
    discovery: bool,

    /// Restrict discovery to interfaces whose name matches this regex.
    #[arg(long, env = "TEREDOD_DISCOVERY_IFNAME")]
    discovery_ifname: Option<String>,

    /// Announce discovery even on interfaces without a private IPv4
    /// address.
    #[arg(long, env = "TEREDOD_DISCOVERY_FORCED", default_value_t = false)]
    discovery_forced: bool,

    /// Maximum number of tracked peers.
    #[arg(long, env = "TEREDOD_PEER_CAPACITY", default_value_t = 500)]
    peer_capacity: usize,

    /// Per-peer byte budget for payloads queued during path establishment.
    #[arg(long, env = "TEREDOD_PEER_QUEUE_BYTES", default_value_t = 4096)]
    peer_queue_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Role {
    Client,
    Relay,
    Server,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    run(Cli::parse()).await
}

async fn run(cli: Cli) -> Result<()> {
    let prefix = u32::from_be_bytes(
        cli.prefix.octets()[..4]
            .try_into()
            .expect("an IPv6 address has at least 4 octets"),
    );
    if !is_valid_teredo_prefix(prefix) {
        bail!("Invalid Teredo IPv6 prefix: {}", cli.prefix);
    }

    let port = match (cli.port, cli.role) {
        (0, Role::Server) => TEREDO_PORT,
        (0, _) => CLIENT_PORT,
        (port, _) => port,
    };

    let clock = Clock::new();
    let keys = Arc::new(TokenKeys::new());

    let tun = Arc::new(TunDevice::create(&cli.ifname)?);
    tun.set_mtu(cli.mtu)?;
    tun.bring_up()?;
    tracing::info!(ifname = %tun.name(), "Tunnel interface is ready");

    let relay = Arc::new(Relay::new(
        clock,
        Arc::clone(&keys),
        RelayConfig {
            discovery: cli.discovery && cli.role == Role::Client,
            peer_capacity: cli.peer_capacity,
            queue_bytes: cli.peer_queue_bytes,
        },
    ));

    let primary = Arc::new(UdpEndpoint::bind(SocketAddrV4::new(cli.bind_address, port))?);
    tracing::info!(%port, "Listening for Teredo traffic");

    let mut tasks = JoinSet::<Result<()>>::new();

    // Keep the announcer handle alive until shutdown; dropping it stops the
    // announcements.
    let mut _discovery = None;

    match cli.role {
        Role::Client => {
            let server = cli
                .server
                .clone()
                .context("--server is required for the client role")?;

            // An unresolvable server at startup is a configuration error,
            // not a transient one.
            resolve_ipv4(&server)
                .await
                .with_context(|| format!("Cannot resolve Teredo server \"{server}\""))?;

            let maintenance = Arc::new(Maintenance::new(
                clock,
                Arc::clone(&keys),
                MaintenanceConfig::new(server),
                Box::new({
                    let primary = Arc::clone(&primary);
                    move |server_ip, nonce| {
                        primary.try_send_to(
                            &router_solicitation(nonce),
                            SocketAddrV4::new(server_ip, TEREDO_PORT),
                        );
                    }
                }),
                Box::new({
                    let relay = Arc::clone(&relay);
                    let configurator = LogConfigurator::new(cli.ifname.clone());
                    move |state: &TeredoState| {
                        relay.set_state(*state);

                        if state.up {
                            configurator.set_address(state.addr);
                            configurator.set_route(Ipv6Addr::UNSPECIFIED, 0);
                        } else {
                            tracing::info!("Teredo tunnel is down");
                        }
                    }
                }),
            ));

            relay.attach_maintenance(Arc::clone(&maintenance));
            tasks.spawn(async move {
                maintenance.run().await;
                Ok(())
            });

            if cli.discovery {
                _discovery = start_discovery(&cli, clock, &keys, &relay, &primary, &tun, &mut tasks)?;
            }
        }
        Role::Relay => {
            relay.set_state(relay_state(prefix, cli.mtu));
        }
        Role::Server => {
            let server = cli
                .server
                .clone()
                .context("--server is required for the server role")?;
            let server_ip = resolve_ipv4(&server)
                .await
                .with_context(|| format!("Cannot resolve our server address \"{server}\""))?;

            // The secondary server address is by convention the next one up.
            let secondary_ip = Ipv4Addr::from(u32::from(server_ip).wrapping_add(1));

            let primary_sock = Arc::new(UdpEndpoint::bind(SocketAddrV4::new(
                server_ip,
                TEREDO_PORT,
            ))?);
            let secondary_sock = Arc::new(UdpEndpoint::bind(SocketAddrV4::new(
                secondary_ip,
                TEREDO_PORT,
            ))?);

            let state = Arc::new(ServerState::new(server_ip, prefix, cli.mtu));

            for on_secondary in [false, true] {
                tasks.spawn(server_pump(
                    Arc::clone(&state),
                    Arc::clone(&primary_sock),
                    Arc::clone(&secondary_sock),
                    Arc::clone(&tun),
                    on_secondary,
                ));
            }

            // The server host also relays between its native IPv6
            // connectivity and Teredo.
            relay.set_state(relay_state(prefix, cli.mtu));
        }
    }

    tasks.spawn(udp_pump(
        "udp",
        Arc::clone(&relay),
        Arc::clone(&primary),
        Arc::clone(&primary),
        Arc::clone(&tun),
    ));
    tasks.spawn(tunnel_pump(
        Arc::clone(&relay),
        Arc::clone(&tun),
        Arc::clone(&primary),
    ));

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Exiting on SIGINT"),
        _ = sigterm.recv() => tracing::info!("Exiting on SIGTERM"),
        Some(finished) = tasks.join_next() => match finished {
            Ok(Err(e)) => tracing::error!("I/O task failed: {e:#}"),
            Ok(Ok(())) => {}
            Err(e) => tracing::error!("I/O task panicked: {e}"),
        },
    }

    // Stop the announcer first, then everything else; sockets, the peer
    // list and the device close when the last handles drop.
    drop(_discovery);
    tasks.shutdown().await;

    Ok(())
}

fn start_discovery(
    cli: &Cli,
    clock: Clock,
    keys: &Arc<TokenKeys>,
    relay: &Arc<Relay>,
    primary: &Arc<UdpEndpoint>,
    tun: &Arc<TunDevice>,
    tasks: &mut JoinSet<Result<()>>,
) -> Result<Option<Discovery>> {
    let ifname = cli
        .discovery_ifname
        .as_deref()
        .map(regex::Regex::new)
        .transpose()
        .context("Invalid discovery interface regex")?;

    let cfg = DiscoveryConfig {
        enabled: true,
        ifname,
        forced: cli.discovery_forced,
    };

    let interfaces = eligible_interfaces(platform::list_interfaces(), &cfg);
    if interfaces.is_empty() {
        tracing::warn!("No suitable interface for local discovery");
        return Ok(None);
    }

    // Discovery bubbles arrive on the Teredo service port, which we do not
    // otherwise bind in the client role.
    let receiver = Arc::new(UdpEndpoint::bind(SocketAddrV4::new(
        Ipv4Addr::UNSPECIFIED,
        TEREDO_PORT,
    ))?);
    for iface in &interfaces {
        if let Err(e) = receiver.join_discovery_group(iface.ipv4) {
            tracing::warn!(iface = %iface.name, "Discovery multicast subscription failed: {e}");
        }
    }

    tasks.spawn(udp_pump(
        "discovery",
        Arc::clone(relay),
        receiver,
        Arc::clone(primary),
        Arc::clone(tun),
    ));

    Ok(Some(Discovery::spawn(
        clock,
        Arc::clone(keys),
        Arc::clone(relay),
        interfaces,
        Box::new({
            let primary = Arc::clone(primary);
            move |iface, buf| primary.send_multicast_via(iface.ipv4, &buf)
        }),
    )))
}

/// Receives Teredo datagrams and feeds them through the relay engine.
async fn udp_pump(
    label: &'static str,
    relay: Arc<Relay>,
    recv: Arc<UdpEndpoint>,
    send: Arc<UdpEndpoint>,
    tun: Arc<TunDevice>,
) -> Result<()> {
    let mut buf = vec![0u8; MAX_UDP_SIZE];

    loop {
        let (n, src) = recv
            .recv_from(&mut buf)
            .await
            .context("UDP receive failed")?;

        match relay.handle_udp_input(&buf[..n], src) {
            Ok(transmits) => execute(&send, &tun, transmits).await,
            Err(e) => tracing::debug!(%src, pump = label, "Dropping datagram: {e}"),
        }
    }
}

/// Reads IPv6 packets off the tunnel and feeds them through the relay
/// engine.
async fn tunnel_pump(relay: Arc<Relay>, tun: Arc<TunDevice>, send: Arc<UdpEndpoint>) -> Result<()> {
    let mut buf = vec![0u8; MAX_UDP_SIZE];

    loop {
        let n = tun.recv(&mut buf).await.context("Tunnel read failed")?;

        match relay.handle_tunnel_input(&buf[..n]) {
            Ok(transmits) => execute(&send, &tun, transmits).await,
            Err(e) => tracing::debug!("Dropping outbound packet: {e}"),
        }
    }
}

async fn execute(send: &UdpEndpoint, tun: &TunDevice, transmits: Vec<Transmit>) {
    for transmit in transmits {
        match transmit {
            Transmit::Udp { dst, payload } => {
                if let Err(e) = send.send_to(&payload, dst).await {
                    tracing::debug!(%dst, "UDP send failed: {e}");
                }
            }
            Transmit::Tunnel { packet } => {
                if let Err(e) = tun.send(&packet).await {
                    tracing::debug!("Tunnel write failed: {e}");
                }
            }
        }
    }
}

/// Serves one of the two server sockets.
async fn server_pump(
    state: Arc<ServerState>,
    primary: Arc<UdpEndpoint>,
    secondary: Arc<UdpEndpoint>,
    tun: Arc<TunDevice>,
    on_secondary: bool,
) -> Result<()> {
    let recv = if on_secondary {
        Arc::clone(&secondary)
    } else {
        Arc::clone(&primary)
    };
    let mut buf = vec![0u8; MAX_UDP_SIZE];

    loop {
        let (n, src) = recv
            .recv_from(&mut buf)
            .await
            .context("UDP receive failed")?;

        let transmits = match state.handle_datagram(&buf[..n], src, on_secondary) {
            Ok(transmits) => transmits,
            Err(e) => {
                tracing::debug!(%src, "Dropping datagram: {e}");
                continue;
            }
        };

        for transmit in transmits {
            match transmit {
                ServerTx::Udp {
                    dst,
                    secondary: use_secondary,
                    payload,
                } => {
                    let sock = if use_secondary { &secondary } else { &primary };
                    if let Err(e) = sock.send_to(&payload, dst).await {
                        tracing::debug!(%dst, "UDP send failed: {e}");
                    }
                }
                ServerTx::Tunnel { packet } => {
                    if let Err(e) = tun.send(&packet).await {
                        tracing::debug!("Tunnel write failed: {e}");
                    }
                }
            }
        }
    }
}

async fn resolve_ipv4(name: &str) -> Result<Ipv4Addr> {
    let mut addrs = tokio::net::lookup_host((name, 0)).await?;

    addrs
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
        .context("no IPv4 address")
}

/// The static state of a relay: no qualification, just a prefix to serve.
fn relay_state(prefix: u32, mtu: u16) -> TeredoState {
    let mut octets = [0u8; 16];
    octets[..4].copy_from_slice(&prefix.to_be_bytes());

    TeredoState {
        up: true,
        mtu,
        addr: Ipv6Addr::from(octets),
        ipv4: Ipv4Addr::UNSPECIFIED,
    }
}
