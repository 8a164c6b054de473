use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::DnsCache;
use crate::config::ServerConfig;
use crate::dns_message::{min_answer_ttl, parse_request};
use crate::error::ForwarderError;
use crate::forwarder::UpstreamForwarder;
use crate::router::PendingClient;

type InflightSender = watch::Sender<Option<Bytes>>;

const RECEIVE_BACKOFF_MIN: Duration = Duration::from_millis(10);
const RECEIVE_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Caching DNS forwarder listening on one UDP socket.
pub struct DnsServer {
    /// Emptied on shutdown; in-flight tasks keep their own clones until they answer.
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local_addr: SocketAddr,
    relay: Arc<Relay>,
    shutdown: CancellationToken,
}

/// Per-query pipeline shared by every spawned task: cache first, upstream on a miss.
struct Relay {
    cache: Arc<DnsCache>,
    forwarder: UpstreamForwarder,
    inflight: DashMap<String, InflightSender>,
    config: ServerConfig,
}

/// Withdraws a leader's in-flight registration on every exit path, releasing its followers.
struct InflightGuard<'a> {
    inflight: &'a DashMap<String, InflightSender>,
    name: &'a str,
    armed: bool,
}

impl InflightGuard<'_> {
    /// Deregister and hand `response` to every follower.
    fn release(mut self, response: Option<Bytes>) {
        self.armed = false;
        if let Some((_, tx)) = self.inflight.remove(self.name) {
            if response.is_some() {
                let _ = tx.send(response);
            }
        }
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inflight.remove(self.name);
        }
    }
}

/// Pause after consecutive receive errors, doubling up to a ceiling and reset by a good datagram.
#[derive(Debug)]
struct ReceiveBackoff {
    next: Duration,
}

impl ReceiveBackoff {
    fn new() -> Self {
        Self {
            next: RECEIVE_BACKOFF_MIN,
        }
    }

    fn on_error(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(RECEIVE_BACKOFF_MAX);
        delay
    }

    fn reset(&mut self) {
        self.next = RECEIVE_BACKOFF_MIN;
    }
}

enum Inflight {
    Leader,
    Follower(watch::Receiver<Option<Bytes>>),
}

impl DnsServer {
    /// Bind the listening socket on the configured port, or on the fallback
    /// port when that fails. Failing both is fatal.
    pub async fn bind(config: ServerConfig) -> Result<Self, ForwarderError> {
        let socket = match bind_port(config.bind_address, config.port).await {
            Ok(socket) => socket,
            Err(e) if config.port != config.fallback_port => {
                warn!(
                    port = config.port,
                    fallback = config.fallback_port,
                    error = %e,
                    "Could not bind requested port, falling back"
                );
                bind_port(config.bind_address, config.fallback_port)
                    .await
                    .map_err(|source| ForwarderError::Bind {
                        requested: config.port,
                        fallback: config.fallback_port,
                        source,
                    })?
            }
            Err(source) => {
                return Err(ForwarderError::Bind {
                    requested: config.port,
                    fallback: config.fallback_port,
                    source,
                })
            }
        };

        let local_addr = socket.local_addr().map_err(|source| ForwarderError::Bind {
            requested: config.port,
            fallback: config.fallback_port,
            source,
        })?;

        let forwarder =
            UpstreamForwarder::new(config.upstream, config.upstream_timeout, config.buffer_size);

        let relay = Relay {
            cache: Arc::new(DnsCache::new(config.cache_capacity)),
            forwarder,
            inflight: DashMap::new(),
            config,
        };

        Ok(Self {
            socket: Mutex::new(Some(Arc::new(socket))),
            local_addr,
            relay: Arc::new(relay),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn cache(&self) -> &Arc<DnsCache> {
        &self.relay.cache
    }

    /// Receive datagrams until [`shutdown`](Self::shutdown) is called.
    /// Each datagram is handled on its own task; a failure only drops that query.
    pub async fn run(&self) {
        let Some(socket) = self.socket_handle() else {
            warn!(listen = %self.local_addr, "Server already shut down");
            return;
        };

        let sweeper = self.relay.config.sweep_interval.map(|interval| {
            self.relay
                .cache
                .spawn_sweeper(interval, self.shutdown.child_token())
        });

        info!(
            listen = %self.local_addr,
            upstream = %self.relay.forwarder.upstream(),
            "Server listening"
        );

        let buffer_size = self.relay.config.buffer_size;
        let mut buf = vec![0u8; buffer_size];
        let mut backoff = ReceiveBackoff::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = socket.recv_from(&mut buf) => match result {
                    Ok((len, client)) => {
                        backoff.reset();
                        if len == buffer_size {
                            warn!(client = %client, buffer_size, "Datagram filled the receive buffer and may be truncated");
                        }

                        let packet = Bytes::copy_from_slice(&buf[..len]);
                        let relay = Arc::clone(&self.relay);
                        let socket = Arc::clone(&socket);
                        tokio::spawn(async move {
                            if let Err(e) = relay.handle_packet(&socket, packet, client).await {
                                warn!(client = %client, error = %e, "Dropped query");
                            }
                        });
                    }
                    Err(e) => {
                        let e = ForwarderError::Receive(e);
                        let delay = backoff.on_error();
                        warn!(error = %e, retry_in = ?delay, "Receive failed");
                        tokio::select! {
                            _ = self.shutdown.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        drop(socket);
        self.release_socket();

        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
        info!(listen = %self.local_addr, "Server has stopped");
    }

    /// Stop the receive loop and the cache sweeper. Safe to call any number of times.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            debug!(listen = %self.local_addr, "Shutdown requested");
        }
        self.shutdown.cancel();
        self.release_socket();
    }

    fn socket_handle(&self) -> Option<Arc<UdpSocket>> {
        self.socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drop the server's own handle; the port is free once in-flight tasks finish.
    fn release_socket(&self) {
        self.socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

async fn bind_port(address: IpAddr, port: u16) -> std::io::Result<UdpSocket> {
    UdpSocket::bind(SocketAddr::new(address, port)).await
}

impl Relay {
    async fn handle_packet(
        &self,
        socket: &UdpSocket,
        packet: Bytes,
        client: SocketAddr,
    ) -> Result<(), ForwarderError> {
        let (header, question) = parse_request(&packet)?;
        let pending = PendingClient::new(client, header.id);

        if let Some(payload) = self.cache.get_fresh(&question.name) {
            debug!(client = %client, name = %question.name, "Cache HIT");
            return pending.respond(socket, &payload).await;
        }

        debug!(client = %client, name = %question.name, qtype = question.qtype, "Cache MISS");

        let payload = self.relay(&question.name, &packet).await?;
        pending.respond(socket, &payload).await
    }

    async fn relay(&self, name: &str, query: &Bytes) -> Result<Bytes, ForwarderError> {
        match self.register_or_join(name) {
            Inflight::Leader => self.relay_as_leader(name, query).await,
            Inflight::Follower(rx) => self.await_leader(name, rx).await,
        }
    }

    fn register_or_join(&self, name: &str) -> Inflight {
        match self.inflight.entry(name.to_owned()) {
            dashmap::Entry::Occupied(e) => Inflight::Follower(e.get().subscribe()),
            dashmap::Entry::Vacant(e) => {
                let (tx, _) = watch::channel(None);
                e.insert(tx);
                Inflight::Leader
            }
        }
    }

    async fn relay_as_leader(&self, name: &str, query: &Bytes) -> Result<Bytes, ForwarderError> {
        let guard = InflightGuard {
            inflight: &self.inflight,
            name,
            armed: true,
        };

        // A relay for this name may have finished between the cache check and registration.
        if let Some(payload) = self.cache.get_fresh(name) {
            guard.release(Some(payload.clone()));
            return Ok(payload);
        }

        let result = self.forwarder.forward(query).await;

        if let Ok(response) = &result {
            let ttl = self.config.cache_ttl(min_answer_ttl(response));
            self.cache.store(name, response.clone(), ttl);
            debug!(name = %name, ttl_secs = ttl.as_secs(), "Cached upstream response");
        }

        guard.release(result.as_ref().ok().cloned());
        result
    }

    async fn await_leader(
        &self,
        name: &str,
        mut rx: watch::Receiver<Option<Bytes>>,
    ) -> Result<Bytes, ForwarderError> {
        debug!(name = %name, "Joining in-flight relay");

        // An error here only means the leader is gone; a value it sent first is still visible.
        let _ = rx.changed().await;
        let shared = rx.borrow().clone();

        shared
            .or_else(|| self.cache.get_fresh(name))
            .ok_or_else(|| ForwarderError::RelayAbandoned(name.to_owned()))
    }
}
