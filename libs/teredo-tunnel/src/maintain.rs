use crate::{Clock, TokenKeys};
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
use std::pin::Pin;
use std::sync::Arc;
use teredo_proto::{
    is_ipv4_global_unicast, parse_router_advertisement, teredo_flags, RouterAdvert, TeredoPacket,
    ALL_ROUTERS, CLIENT_LINK_LOCAL, RANDOM_MASK, TEREDO_PORT,
};
use tokio::sync::Notify;

/// Published state of the Teredo interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeredoState {
    pub up: bool,
    pub mtu: u16,
    /// Our Teredo address once qualified. While resolving, an
    /// all-zero address carrying only the server (so the datapath knows whom
    /// to relay through).
    pub addr: Ipv6Addr,
    /// Our mapped public IPv4, as learned from the server's origin
    /// indication.
    pub ipv4: Ipv4Addr,
}

impl TeredoState {
    pub fn down() -> Self {
        Self {
            up: false,
            mtu: 1280,
            addr: Ipv6Addr::UNSPECIFIED,
            ipv4: Ipv4Addr::UNSPECIFIED,
        }
    }
}

impl Default for TeredoState {
    fn default() -> Self {
        Self::down()
    }
}

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Host name (or literal address) of the Teredo server.
    pub server: String,
    /// How long to wait for a Router Advertisement, in seconds.
    pub qualification_delay: u64,
    /// Unanswered solicitations before we consider connectivity lost.
    pub qualification_retries: u32,
    /// NAT-binding refresh period once qualified, in seconds.
    pub refresh_delay: u64,
    /// Pause before starting over after a failure, in seconds.
    pub restart_delay: u64,
}

impl MaintenanceConfig {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            qualification_delay: 4,
            qualification_retries: 3,
            refresh_delay: 30,
            restart_delay: 100,
        }
    }
}

/// Why a Router Advertisement was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RaError {
    #[error("source port is not the Teredo service port")]
    WrongPort,
    #[error("no authentication header")]
    MissingAuth,
    #[error("authentication with the server failed")]
    AuthFailed,
    #[error("not addressed to the solicitation rendezvous")]
    WrongDestination,
    #[error("no solicitation is pending")]
    NotSoliciting,
    #[error("nonce does not match the pending solicitation")]
    NonceMismatch,
    #[error("advertisement does not parse")]
    Malformed,
    #[error("advertised server differs from the solicited one")]
    ServerMismatch,
}

type ResolveFuture = Pin<Box<dyn Future<Output = io::Result<Ipv4Addr>> + Send>>;
type ResolveFn = Box<dyn Fn(String) -> ResolveFuture + Send + Sync>;
type SendRsFn = Box<dyn Fn(Ipv4Addr, [u8; 8]) + Send + Sync>;
type StateCallback = Box<dyn Fn(&TeredoState) + Send + Sync>;

/// The client qualification and NAT-binding maintenance procedure.
///
/// [`Maintenance::run`] drives the state machine: resolve the server,
/// solicit, wait for a matching advertisement, refresh, start over on
/// failure. The UDP receive path feeds advertisements in through
/// [`Maintenance::process_ra`]; an accepted one wakes the waiting task.
///
/// The state callback fires under the maintenance lock, so observers see
/// transitions in order and exactly once per logical change.
pub struct Maintenance {
    clock: Clock,
    keys: Arc<TokenKeys>,
    cfg: MaintenanceConfig,
    shared: Mutex<Shared>,
    received: Notify,
    send_rs: SendRsFn,
    on_state_change: StateCallback,
    resolve: ResolveFn,
}

struct Shared {
    state: TeredoState,
    server_ip: Option<Ipv4Addr>,
    nonce: [u8; 8],
    soliciting: bool,
    /// Advertisement accepted for the pending solicitation, awaiting pickup.
    accepted: Option<RouterAdvert>,
}

impl Maintenance {
    pub fn new(
        clock: Clock,
        keys: Arc<TokenKeys>,
        cfg: MaintenanceConfig,
        send_rs: SendRsFn,
        on_state_change: StateCallback,
    ) -> Self {
        Self {
            clock,
            keys,
            cfg,
            shared: Mutex::new(Shared {
                state: TeredoState::down(),
                server_ip: None,
                nonce: [0; 8],
                soliciting: false,
                accepted: None,
            }),
            received: Notify::new(),
            send_rs,
            on_state_change,
            resolve: Box::new(|server| Box::pin(resolve_ipv4(server))),
        }
    }

    /// Replaces the DNS hook, e.g. with a canned answer in tests.
    pub fn with_resolver(mut self, resolve: ResolveFn) -> Self {
        self.resolve = resolve;
        self
    }

    pub fn state(&self) -> TeredoState {
        self.shared.lock().state
    }

    /// Validates a Router Advertisement against the pending solicitation and,
    /// if it matches, hands it to the maintenance task.
    pub fn process_ra(&self, packet: &TeredoPacket, src: SocketAddrV4) -> Result<(), RaError> {
        if src.port() != TEREDO_PORT {
            return Err(RaError::WrongPort);
        }

        // Advertisements without a nonce are far too easy to spoof.
        let auth = packet.auth.ok_or(RaError::MissingAuth)?;

        let dst = packet.destination();
        if dst != CLIENT_LINK_LOCAL && dst != ALL_ROUTERS {
            return Err(RaError::WrongDestination);
        }

        if auth.fail {
            tracing::error!("Authentication with server failed");
            return Err(RaError::AuthFailed);
        }

        let mut shared = self.shared.lock();

        if !shared.soliciting {
            return Err(RaError::NotSoliciting);
        }
        let server_ip = shared.server_ip.ok_or(RaError::NotSoliciting)?;
        if auth.nonce != shared.nonce {
            return Err(RaError::NonceMismatch);
        }

        let ra = parse_router_advertisement(packet).ok_or(RaError::Malformed)?;
        if ra.addr.server != server_ip {
            return Err(RaError::ServerMismatch);
        }

        shared.accepted = Some(ra);
        self.received.notify_one();

        Ok(())
    }

    pub async fn run(self: Arc<Self>) {
        let mut deadline = self.clock.now();
        let mut retries: u32 = 0;
        let mut blackhole = false;

        loop {
            let mut server_ip = self.shared.lock().server_ip;

            // Resolve the server, retrying forever.
            while server_ip.is_none() {
                let resolved = (self.resolve)(self.cfg.server.clone()).await;
                deadline = self.clock.now();

                match resolved {
                    Ok(ip) if !is_ipv4_global_unicast(ip) => {
                        tracing::error!("Teredo server has a non-global IPv4 address");
                    }
                    Ok(ip) => {
                        let mut shared = self.shared.lock();
                        shared.server_ip = Some(ip);

                        // Tell observers about the new server while still
                        // down; the datapath needs it for the relayed paths.
                        debug_assert!(!shared.state.up);
                        shared.state.addr = server_only_addr(ip);
                        (self.on_state_change)(&shared.state);

                        server_ip = Some(ip);
                    }
                    Err(e) => {
                        tracing::error!(
                            server = %self.cfg.server,
                            "Cannot resolve Teredo server address: {e}"
                        );
                    }
                }

                if server_ip.is_none() {
                    deadline += self.cfg.restart_delay;
                    self.clock.sleep_until(deadline).await;
                }
            }
            let Some(server_ip) = server_ip else {
                unreachable!("loop above only exits once resolved")
            };

            loop {
                deadline += self.cfg.qualification_delay;
                if self.clock.reschedule(&mut deadline) {
                    break;
                }
            }

            // Send the Router Solicitation, bound to a fresh nonce.
            {
                let mut shared = self.shared.lock();
                let nonce = self.keys.nonce(deadline, server_ip, TEREDO_PORT);
                shared.nonce = nonce;
                shared.soliciting = true;
                (self.send_rs)(server_ip, nonce);
            }

            // Wait for a matching advertisement or the deadline.
            let accepted = loop {
                if let Some(ra) = self.shared.lock().accepted.take() {
                    break Some(ra);
                }

                let notified = self.received.notified();
                tokio::select! {
                    () = notified => {}
                    () = self.clock.sleep_until(deadline) => break None,
                }
            };

            let delay;
            {
                let mut shared = self.shared.lock();
                shared.soliciting = false;
                shared.accepted = None;

                match accepted {
                    Some(ra) => {
                        retries = 0;
                        blackhole = false;

                        let ostate = shared.state;

                        // Keep the flag randomization stable unless the
                        // address itself changed.
                        let mut addr = ra.addr;
                        addr.flags = teredo_flags(&ostate.addr);
                        if addr.to_ipv6() != ostate.addr {
                            addr.flags = self.keys.flag_bits(deadline) & RANDOM_MASK;
                        }

                        shared.state = TeredoState {
                            up: true,
                            mtu: ra.mtu,
                            addr: addr.to_ipv6(),
                            ipv4: ra.addr.client,
                        };

                        if !ostate.up
                            || ostate.addr != shared.state.addr
                            || ostate.mtu != shared.state.mtu
                        {
                            tracing::info!(
                                addr = %shared.state.addr,
                                mtu = shared.state.mtu,
                                "New Teredo address/MTU"
                            );
                            (self.on_state_change)(&shared.state);
                        }

                        delay = self.cfg.refresh_delay;
                    }
                    None => {
                        retries += 1;

                        if retries >= self.cfg.qualification_retries {
                            retries = 0;

                            if !blackhole {
                                tracing::info!("No reply from Teredo server");
                                blackhole = true;
                            }

                            if shared.state.up {
                                tracing::info!("Lost Teredo connectivity");
                                shared.state.up = false;
                                (self.on_state_change)(&shared.state);
                            }

                            // Force a new resolution; the server may have
                            // moved.
                            shared.server_ip = None;
                            delay = self.cfg.restart_delay;
                        } else {
                            // Re-solicit right away.
                            delay = 0;
                        }
                    }
                }
            }

            if delay > 0 {
                deadline = deadline - self.cfg.qualification_delay + delay;
                self.clock.reschedule(&mut deadline);
                self.clock.sleep_until(deadline).await;
            }
        }
    }
}

async fn resolve_ipv4(server: String) -> io::Result<Ipv4Addr> {
    let addrs = tokio::net::lookup_host((server.as_str(), 0)).await?;

    addrs
        .filter_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no IPv4 address"))
}

fn server_only_addr(server: Ipv4Addr) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets[4..8].copy_from_slice(&server.octets());

    Ipv6Addr::from(octets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use teredo_proto::{router_advertisement, RouterAdvertParams, TeredoAddr, TEREDO_PREFIX};
    use tokio::sync::mpsc;

    const SERVER: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 1);

    struct Harness {
        maintenance: Arc<Maintenance>,
        solicitations: mpsc::UnboundedReceiver<(Ipv4Addr, [u8; 8])>,
        states: Arc<Mutex<Vec<TeredoState>>>,
        task: tokio::task::JoinHandle<()>,
    }

    fn start() -> Harness {
        let (rs_tx, solicitations) = mpsc::unbounded_channel();
        let states = Arc::new(Mutex::new(Vec::new()));

        let maintenance = Arc::new(
            Maintenance::new(
                Clock::new(),
                Arc::new(TokenKeys::new()),
                MaintenanceConfig::new("teredo.example.net"),
                Box::new(move |server, nonce| {
                    let _ = rs_tx.send((server, nonce));
                }),
                Box::new({
                    let states = Arc::clone(&states);
                    move |state| states.lock().push(*state)
                }),
            )
            .with_resolver(Box::new(|_server| Box::pin(async { Ok(SERVER) }))),
        );

        let task = tokio::spawn(Arc::clone(&maintenance).run());

        Harness {
            maintenance,
            solicitations,
            states,
            task,
        }
    }

    impl Harness {
        fn advertise(&self, nonce: [u8; 8], client: SocketAddrV4) {
            let buf = router_advertisement(&RouterAdvertParams {
                nonce,
                dest: CLIENT_LINK_LOCAL,
                client,
                prefix: TEREDO_PREFIX,
                server_ip: SERVER,
                mtu: 1280,
            });
            let packet = TeredoPacket::parse(&buf).unwrap();

            self.maintenance
                .process_ra(&packet, SocketAddrV4::new(SERVER, TEREDO_PORT))
                .unwrap();
        }

        fn up_transitions(&self) -> usize {
            self.states.lock().iter().filter(|s| s.up).count()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn qualification_happy_path() {
        let mut harness = start();

        let (server, nonce) = harness.solicitations.recv().await.unwrap();
        assert_eq!(server, SERVER);

        let mapped = SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 7), 40000);
        harness.advertise(nonce, mapped);

        tokio::time::sleep(Duration::from_millis(10)).await;

        let state = harness.maintenance.state();
        assert!(state.up);
        assert_eq!(state.mtu, 1280);
        assert_eq!(state.ipv4, *mapped.ip());

        let addr = TeredoAddr::from_ipv6(state.addr).unwrap();
        assert_eq!(addr.server, SERVER);
        assert_eq!(addr.client, *mapped.ip());
        assert_eq!(addr.port, mapped.port());
        assert_eq!(addr.flags & !RANDOM_MASK, 0, "cone flag must stay clear");

        assert_eq!(harness.up_transitions(), 1);

        harness.task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn nonce_mismatch_leaves_state_down() {
        let mut harness = start();

        let (_, nonce) = harness.solicitations.recv().await.unwrap();

        let mut wrong = nonce;
        wrong[0] ^= 0xff;

        let buf = router_advertisement(&RouterAdvertParams {
            nonce: wrong,
            dest: CLIENT_LINK_LOCAL,
            client: SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 7), 40000),
            prefix: TEREDO_PREFIX,
            server_ip: SERVER,
            mtu: 1280,
        });
        let packet = TeredoPacket::parse(&buf).unwrap();

        assert_eq!(
            harness
                .maintenance
                .process_ra(&packet, SocketAddrV4::new(SERVER, TEREDO_PORT))
                .unwrap_err(),
            RaError::NonceMismatch
        );

        // Exhaust the qualification retries.
        for _ in 0..2 {
            harness.solicitations.recv().await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(15)).await;

        assert!(!harness.maintenance.state().up);
        assert_eq!(harness.up_transitions(), 0);

        harness.task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn identical_refresh_does_not_refire_callback() {
        let mut harness = start();

        let (_, nonce) = harness.solicitations.recv().await.unwrap();
        let mapped = SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 7), 40000);
        harness.advertise(nonce, mapped);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(harness.up_transitions(), 1);

        // The refresh solicitation fires ~30 s later; answer it twice with
        // the same advertisement.
        let (_, nonce) = harness.solicitations.recv().await.unwrap();
        harness.advertise(nonce, mapped);
        harness.advertise(nonce, mapped);

        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(harness.maintenance.state().up);
        assert_eq!(harness.up_transitions(), 1, "unchanged state must not refire");

        harness.task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_unauthenticated_advertisements() {
        let harness = start();

        let buf = router_advertisement(&RouterAdvertParams {
            nonce: [0; 8],
            dest: CLIENT_LINK_LOCAL,
            client: SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 7), 40000),
            prefix: TEREDO_PREFIX,
            server_ip: SERVER,
            mtu: 1280,
        });

        // Strip the 13-byte authentication header.
        let packet = TeredoPacket::parse(&buf[13..]).unwrap();

        assert_eq!(
            harness
                .maintenance
                .process_ra(&packet, SocketAddrV4::new(SERVER, TEREDO_PORT))
                .unwrap_err(),
            RaError::MissingAuth
        );

        harness.task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_wrong_source_port() {
        let harness = start();

        let buf = router_advertisement(&RouterAdvertParams {
            nonce: [0; 8],
            dest: CLIENT_LINK_LOCAL,
            client: SocketAddrV4::new(Ipv4Addr::new(198, 51, 100, 7), 40000),
            prefix: TEREDO_PREFIX,
            server_ip: SERVER,
            mtu: 1280,
        });
        let packet = TeredoPacket::parse(&buf).unwrap();

        assert_eq!(
            harness
                .maintenance
                .process_ra(&packet, SocketAddrV4::new(SERVER, 40001))
                .unwrap_err(),
            RaError::WrongPort
        );

        harness.task.abort();
    }
}
