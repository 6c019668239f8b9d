use anyhow::{Context, Result};
use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use swarmcast_core::{
    ConnectionId, JoinOptions, NetworkConfig, PeerIdentity, Substrate, SubstrateEvent, TopicKey,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{spawn_connection, ConnectionTable};
use crate::discovery::{self, DiscoveredPeer, TopicAnnouncement};
use crate::wire::handshake;

const BROWSE_POLL: Duration = Duration::from_millis(200);

/// Shared state handed to accept and dial tasks
#[derive(Clone)]
struct Shared {
    identity: PeerIdentity,
    table: Arc<ConnectionTable>,
    next_id: Arc<AtomicU64>,
    handshake_timeout: Duration,
}

impl Shared {
    fn next_connection_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Handshake on a fresh stream and hand it to the connection tasks
    async fn establish(
        &self,
        mut stream: TcpStream,
        expected: Option<PeerIdentity>,
        events: &mpsc::UnboundedSender<SubstrateEvent>,
    ) -> Result<ConnectionId> {
        let _ = stream.set_nodelay(true);
        let remote =
            tokio::time::timeout(self.handshake_timeout, handshake(&mut stream, self.identity))
                .await
                .context("handshake timed out")??;

        if remote == self.identity {
            anyhow::bail!("dropping connection to self");
        }
        if let Some(expected) = expected.filter(|e| *e != remote) {
            anyhow::bail!(
                "peer announced {} but presented {}",
                expected.short(),
                remote.short()
            );
        }

        let connection_id = self.next_connection_id();
        spawn_connection(stream, remote, connection_id, events.clone(), self.table.clone());
        info!("Connected to {} (conn {})", remote.short(), connection_id);
        Ok(connection_id)
    }
}

/// LAN discovery substrate: TCP transport, mDNS announcement
pub struct Swarm {
    config: NetworkConfig,
    shared: Shared,
    daemon: Option<ServiceDaemon>,
    advertised: Vec<String>,
    browsing: Vec<String>,
    tasks: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    listen_addr: Option<SocketAddr>,
    host_ip: IpAddr,
}

impl Swarm {
    pub fn new(config: NetworkConfig) -> Self {
        Self::with_identity(PeerIdentity::random(), config)
    }

    pub fn with_identity(identity: PeerIdentity, config: NetworkConfig) -> Self {
        let handshake_timeout = Duration::from_millis(config.connect_timeout_ms.max(1));
        Self {
            config,
            shared: Shared {
                identity,
                table: Arc::new(ConnectionTable::default()),
                next_id: Arc::new(AtomicU64::new(1)),
                handshake_timeout,
            },
            daemon: None,
            advertised: Vec::new(),
            browsing: Vec::new(),
            tasks: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            listen_addr: None,
            host_ip: discovery::detect_local_ip(),
        }
    }

    /// Address inbound peers connect to, once joined as server
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    pub fn host_ip(&self) -> IpAddr {
        self.host_ip
    }

    fn daemon(&mut self) -> Result<ServiceDaemon> {
        if let Some(daemon) = &self.daemon {
            return Ok(daemon.clone());
        }
        let daemon = ServiceDaemon::new().context("starting mDNS daemon")?;
        self.daemon = Some(daemon.clone());
        Ok(daemon)
    }

    /// Accept inbound peers on a TCP listener; returns the bound address
    pub async fn listen(
        &mut self,
        events: mpsc::UnboundedSender<SubstrateEvent>,
    ) -> Result<SocketAddr> {
        if let Some(addr) = self.listen_addr {
            return Ok(addr);
        }
        let listener = TcpListener::bind(("0.0.0.0", self.config.listen_port))
            .await
            .with_context(|| format!("binding port {}", self.config.listen_port))?;
        let addr = listener.local_addr()?;
        self.listen_addr = Some(addr);
        info!("Accepting peers on {}", addr);

        let shared = self.shared.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                let (stream, remote_addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                };
                debug!("Inbound connection from {}", remote_addr);
                let shared = shared.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    if let Err(e) = shared.establish(stream, None, &events).await {
                        debug!("Rejected inbound {}: {:#}", remote_addr, e);
                    }
                });
            }
        }));
        Ok(addr)
    }

    /// Dial a known address directly
    pub async fn connect(
        &self,
        addr: SocketAddr,
        events: mpsc::UnboundedSender<SubstrateEvent>,
    ) -> Result<ConnectionId> {
        let timeout = self.shared.handshake_timeout;
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("connecting to {} timed out", addr))?
            .with_context(|| format!("connecting to {}", addr))?;
        self.shared.establish(stream, None, &events).await
    }

    fn browse(
        &mut self,
        topic: TopicKey,
        events: mpsc::UnboundedSender<SubstrateEvent>,
    ) -> Result<()> {
        let daemon = self.daemon()?;
        let service_type = self.config.service_type.clone();
        let receiver = daemon
            .browse(&service_type)
            .with_context(|| format!("browsing {}", service_type))?;
        self.browsing.push(service_type.clone());
        info!("Looking up peers for topic {}", topic.short());

        let (found_tx, mut found_rx) = mpsc::unbounded_channel::<DiscoveredPeer>();
        let stop = self.stop.clone();
        let own = self.shared.identity;
        self.tasks.push(tokio::task::spawn_blocking(move || {
            while !stop.load(Ordering::SeqCst) {
                let event = match receiver.recv_timeout(BROWSE_POLL) {
                    Ok(event) => event,
                    Err(_) if receiver.is_disconnected() => break,
                    Err(_) => continue,
                };
                match event {
                    ServiceEvent::ServiceResolved(info) => {
                        let peer = match DiscoveredPeer::from_service_info(&info) {
                            Ok(peer) => peer,
                            Err(e) => {
                                debug!("Ignoring {}: {}", info.get_fullname(), e);
                                continue;
                            }
                        };
                        if !peer.announcement.matches(&topic) || peer.announcement.identity == own {
                            continue;
                        }
                        if found_tx.send(peer).is_err() {
                            break;
                        }
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => {
                        debug!("Service removed: {}", fullname);
                    }
                    _ => {}
                }
            }
        }));

        let shared = self.shared.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(peer) = found_rx.recv().await {
                let identity = peer.announcement.identity;
                if !shared.table.begin_dial(identity) {
                    continue;
                }
                let shared = shared.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    dial(&shared, &peer, &events).await;
                    shared.table.end_dial(&identity);
                });
            }
        }));
        Ok(())
    }
}

async fn dial(
    shared: &Shared,
    peer: &DiscoveredPeer,
    events: &mpsc::UnboundedSender<SubstrateEvent>,
) {
    let identity = peer.announcement.identity;
    for ip in &peer.addresses {
        let addr = SocketAddr::new(*ip, peer.port);
        let connect = TcpStream::connect(addr);
        let stream = match tokio::time::timeout(shared.handshake_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("Dial {} failed: {}", addr, e);
                continue;
            }
            Err(_) => {
                debug!("Dial {} timed out", addr);
                continue;
            }
        };
        match shared.establish(stream, Some(identity), events).await {
            Ok(_) => return,
            Err(e) => debug!("Handshake with {} failed: {:#}", addr, e),
        }
    }
    warn!("Could not reach peer {} at any announced address", identity.short());
}

#[async_trait]
impl Substrate for Swarm {
    fn local_identity(&self) -> PeerIdentity {
        self.shared.identity
    }

    async fn join(
        &mut self,
        topic: TopicKey,
        options: JoinOptions,
        events: mpsc::UnboundedSender<SubstrateEvent>,
    ) -> Result<()> {
        if options.server {
            let addr = self.listen(events.clone()).await?;
            let daemon = self.daemon()?;
            let announcement = TopicAnnouncement::new(&topic, self.shared.identity);
            let fullname = discovery::advertise(
                &daemon,
                &self.config.service_type,
                &announcement,
                self.host_ip,
                addr.port(),
            )?;
            self.advertised.push(fullname);
        }
        if options.client {
            self.browse(topic, events)?;
        }
        Ok(())
    }

    async fn destroy(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(daemon) = self.daemon.take() {
            for fullname in self.advertised.drain(..) {
                discovery::withdraw(&daemon, &fullname);
            }
            for service_type in self.browsing.drain(..) {
                if let Err(e) = daemon.stop_browse(&service_type) {
                    debug!("stop_browse({}) failed: {}", service_type, e);
                }
            }
            if let Err(e) = daemon.shutdown() {
                debug!("mDNS shutdown error (harmless): {}", e);
            }
        }
        let open = self.shared.table.len();
        self.shared.table.close_all();
        self.listen_addr = None;
        self.stop = Arc::new(AtomicBool::new(false));
        info!(
            "Swarm {} left all topics ({} connections closed)",
            self.shared.identity.short(),
            open
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarmcast_core::{Connection, WireMessage};

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SubstrateEvent>) -> SubstrateEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    fn loopback_config() -> NetworkConfig {
        NetworkConfig {
            listen_port: 0,
            ..NetworkConfig::default()
        }
    }

    #[tokio::test]
    async fn test_direct_connect_exchanges_messages() {
        let mut server = Swarm::new(loopback_config());
        let client = Swarm::new(loopback_config());
        let (server_tx, mut server_rx) = mpsc::unbounded_channel();
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();

        let addr = server.listen(server_tx).await.unwrap();
        let target = SocketAddr::from(([127, 0, 0, 1], addr.port()));
        client.connect(target, client_tx).await.unwrap();

        let client_conn = match next_event(&mut client_rx).await {
            SubstrateEvent::Connected { connection, .. } => connection,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(client_conn.remote_identity(), server.local_identity());

        let server_conn = match next_event(&mut server_rx).await {
            SubstrateEvent::Connected { connection, .. } => connection,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(server_conn.remote_identity(), client.local_identity());

        client_conn
            .write(WireMessage::Text("hello".to_string()))
            .unwrap();
        client_conn.write(WireMessage::stop_sentinel()).unwrap();
        match next_event(&mut server_rx).await {
            SubstrateEvent::Data { identity, message, .. } => {
                assert_eq!(identity, client.local_identity());
                assert_eq!(message, WireMessage::Text("hello".to_string()));
            }
            other => panic!("unexpected {:?}", other),
        }
        match next_event(&mut server_rx).await {
            SubstrateEvent::Data { message, .. } => assert!(message.is_stop_sentinel()),
            other => panic!("unexpected {:?}", other),
        }

        client_conn.close();
        assert!(matches!(
            next_event(&mut server_rx).await,
            SubstrateEvent::Closed { .. }
        ));
        assert!(matches!(
            next_event(&mut client_rx).await,
            SubstrateEvent::Closed { .. }
        ));
        server.destroy().await;
    }

    #[tokio::test]
    async fn test_self_connection_dropped() {
        let mut server = Swarm::new(loopback_config());
        let (tx, _rx) = mpsc::unbounded_channel();
        let addr = server.listen(tx.clone()).await.unwrap();
        let target = SocketAddr::from(([127, 0, 0, 1], addr.port()));
        assert!(server.connect(target, tx).await.is_err());
        server.destroy().await;
    }
}
