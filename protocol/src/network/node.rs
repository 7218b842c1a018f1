//! # Node Runtime
//!
//! The top-level runtime entity of a murmur node. Owns the socket, the
//! peer view, both caches, the seeded RNG, and the event log, and drives
//! everything from one `tokio::select!` loop: inbound datagrams, the
//! ping / pull / discovery timers, the stdin origination reader, and the
//! shutdown channel. All state is mutated from this single task — the
//! suspension points are the awaits you can see in [`run`](NodeRuntime::run),
//! and nothing here needs a lock.
//!
//! ## Lifecycle
//!
//! ```text
//! bind() -> run(shutdown) -> [serving] -> shutdown flips -> node_shutdown
//! ```
//!
//! Binding is the only fatal step. Once `node_listening` is emitted the
//! node stays in service whatever arrives: malformed datagrams, failed
//! sends, and policy rejections are logged and dropped. Shutdown
//! completes the in-flight handler, emits `node_shutdown`, and flushes
//! the log.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use tokio::io::AsyncBufReadExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{NodeConfig, GOSSIP_CACHE_CAP, RECV_BUFFER_BYTES, REQUIRED_CAPABILITIES, WIRE_VERSION};
use crate::events::EventLog;
use crate::identity::{fresh_uuid, NodeIdentity};
use crate::pow::{self, PowCredential};
use crate::wire::{
    self, Envelope, GetPeersPayload, GossipPayload, HelloPayload, IhavePayload, IwantPayload,
    MsgType, PeerRecord, PeersListPayload, PingPayload,
};

use super::cache::{GossipCache, SeenSet};
use super::endpoint::UdpEndpoint;
use super::gossip::GossipEngine;
use super::peers::{PeerView, Upsert};

// ---------------------------------------------------------------------------
// Log destination
// ---------------------------------------------------------------------------

/// Where the structured event log goes.
#[derive(Debug, Clone)]
pub enum LogMode {
    /// File-backed JSONL under this directory (production; the harness
    /// tails these files).
    Dir(PathBuf),
    /// In-memory capture (tests and embedded use).
    Memory,
}

// ---------------------------------------------------------------------------
// NodeRuntime
// ---------------------------------------------------------------------------

/// One running gossip node.
pub struct NodeRuntime {
    cfg: NodeConfig,
    identity: NodeIdentity,
    endpoint: Arc<UdpEndpoint>,
    view: PeerView,
    seen: SeenSet,
    cache: GossipCache,
    engine: GossipEngine,
    rng: StdRng,
    clock: Clock,
    log: Arc<EventLog>,
    /// Mined once at startup when admission PoW is enabled; attached to
    /// every outgoing HELLO.
    hello_pow: Option<PowCredential>,
}

impl NodeRuntime {
    /// Binds the socket and assembles a runtime. Everything downstream
    /// of a successful bind is non-fatal.
    ///
    /// The RNG is seeded with `seed + port` (the *bound* port, so
    /// ephemeral-port nodes stay distinct), and the node id is drawn
    /// from it — a fixed seed replays with identical ids.
    pub async fn bind(cfg: NodeConfig, log_mode: LogMode, clock: Clock) -> std::io::Result<Self> {
        cfg.validate()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;

        let socket = tokio::net::UdpSocket::bind(cfg.bind_addr()).await?;
        let local_addr = socket.local_addr()?;

        let mut rng = StdRng::seed_from_u64(cfg.seed.wrapping_add(local_addr.port() as u64));
        let identity = NodeIdentity::generate(&mut rng, local_addr);

        let log = Arc::new(match &log_mode {
            LogMode::Dir(dir) => {
                EventLog::to_dir(dir, local_addr.port(), &identity.node_id, clock.clone())?
            }
            LogMode::Memory => EventLog::memory(&identity.node_id, clock.clone()),
        });
        let endpoint = Arc::new(UdpEndpoint::from_socket(socket, Arc::clone(&log))?);

        // CPU-bound, runs once, before the first HELLO. Never on the
        // datagram path.
        let hello_pow = if cfg.pow_k > 0 {
            info!(k = cfg.pow_k, "mining admission proof-of-work");
            Some(pow::generate(&identity.node_id, cfg.pow_k))
        } else {
            None
        };

        let view = PeerView::new(
            local_addr,
            cfg.peer_limit,
            cfg.peer_timeout.as_millis() as u64,
        );
        let seen = SeenSet::new(cfg.seen_cap());
        let cache = GossipCache::new(GOSSIP_CACHE_CAP);
        let engine = GossipEngine {
            fanout: cfg.fanout,
            ihave_max_ids: cfg.ihave_max_ids,
        };

        log.log(
            "node_listening",
            json!({
                "peer": local_addr.to_string(),
                "bootstrap": cfg.bootstrap.map(|a| a.to_string()),
                "fanout": cfg.fanout,
                "ttl": cfg.ttl,
                "peer_limit": cfg.peer_limit,
                "ping_interval": cfg.ping_interval.as_secs_f64(),
                "peer_timeout": cfg.peer_timeout.as_secs_f64(),
                "seed": cfg.seed,
                "pull_interval": cfg.pull_interval.as_secs_f64(),
                "discovery_interval": cfg.discovery_interval.as_secs_f64(),
                "ihave_max_ids": cfg.ihave_max_ids,
                "pow_k": cfg.pow_k,
                "stdin": cfg.stdin_enabled,
                "log_path": log.path().map(|p| p.display().to_string()),
            }),
        );
        info!(addr = %local_addr, node_id = %identity.node_id, "node listening");

        Ok(Self {
            cfg,
            identity,
            endpoint,
            view,
            seen,
            cache,
            engine,
            rng,
            clock,
            log,
            hello_pow,
        })
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.identity.addr
    }

    /// This node's id.
    pub fn node_id(&self) -> &str {
        &self.identity.node_id
    }

    /// Handle on the event log, for callers that outlive the runtime.
    pub fn log_handle(&self) -> Arc<EventLog> {
        Arc::clone(&self.log)
    }

    /// Number of peers currently in the view.
    pub fn peer_count(&self) -> usize {
        self.view.len()
    }

    // -----------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------

    /// Serves until `shutdown` flips to `true` (or its sender drops).
    /// Consumes the runtime; grab [`log_handle`](Self::log_handle)
    /// first if you need the log afterwards.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.send_bootstrap().await;

        let endpoint = Arc::clone(&self.endpoint);
        let mut buf = vec![0u8; RECV_BUFFER_BYTES];

        let mut ping_timer = delayed_interval(self.cfg.ping_interval, true);
        let pull_on = self.cfg.pull_enabled();
        let mut pull_timer = delayed_interval(self.cfg.pull_interval, pull_on);
        let discovery_on = self.cfg.discovery_enabled();
        let mut discovery_timer = delayed_interval(self.cfg.discovery_interval, discovery_on);

        let mut stdin_open = self.cfg.stdin_enabled;
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

        loop {
            tokio::select! {
                received = endpoint.recv(&mut buf) => match received {
                    Ok((len, src)) => {
                        let data = buf[..len].to_vec();
                        self.handle_datagram(&data, src).await;
                    }
                    Err(e) => {
                        self.log.log("udp_error", json!({"reason": e.to_string()}));
                        warn!(error = %e, "datagram receive failed");
                    }
                },
                _ = ping_timer.tick() => self.ping_tick().await,
                _ = pull_timer.tick(), if pull_on => self.pull_tick().await,
                _ = discovery_timer.tick(), if discovery_on => self.discovery_tick().await,
                line = lines.next_line(), if stdin_open => match line {
                    Ok(Some(line)) => {
                        let text = line.trim();
                        if !text.is_empty() {
                            self.originate(text.to_string()).await;
                        }
                    }
                    // EOF or a broken pipe: origination is over, the
                    // node keeps serving.
                    Ok(None) | Err(_) => stdin_open = false,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.log.log("node_shutdown", json!({}));
        self.log.flush();
        info!("node stopped");
    }

    /// Contacts the configured bootstrap peer, once, at startup.
    async fn send_bootstrap(&mut self) {
        let Some(bootstrap) = self.cfg.bootstrap else {
            return;
        };
        if bootstrap == self.identity.addr {
            return;
        }

        let hello = self.make_hello();
        self.endpoint.send(&hello, bootstrap).await;
        self.log.log(
            "bootstrap_hello_sent",
            json!({"peer": bootstrap.to_string(), "msg_id": hello.msg_id}),
        );

        let get_peers = self.make_get_peers(self.cfg.peer_limit);
        self.endpoint.send(&get_peers, bootstrap).await;
        self.log.log(
            "bootstrap_get_peers_sent",
            json!({"peer": bootstrap.to_string(), "msg_id": get_peers.msg_id}),
        );
    }

    // -----------------------------------------------------------------
    // Envelope construction
    // -----------------------------------------------------------------

    fn base_envelope(&mut self, kind: MsgType, payload: Value, ttl: Option<i64>) -> Envelope {
        Envelope {
            version: WIRE_VERSION,
            msg_id: fresh_uuid(&mut self.rng),
            msg_type: kind.as_str().to_string(),
            sender_id: self.identity.node_id.clone(),
            sender_addr: self.identity.addr_string(),
            timestamp_ms: self.clock.now_ms() as i64,
            payload,
            ttl,
        }
    }

    fn make_hello(&mut self) -> Envelope {
        let payload = HelloPayload {
            capabilities: REQUIRED_CAPABILITIES.iter().map(|s| s.to_string()).collect(),
            pow: self.hello_pow.clone(),
        };
        let payload = serde_json::to_value(payload).unwrap_or_default();
        self.base_envelope(MsgType::Hello, payload, None)
    }

    fn make_get_peers(&mut self, max_peers: usize) -> Envelope {
        self.base_envelope(
            MsgType::GetPeers,
            json!({"max_peers": max_peers}),
            None,
        )
    }

    fn make_peers_list(&mut self, peers: Vec<PeerRecord>) -> Envelope {
        let payload = serde_json::to_value(PeersListPayload { peers }).unwrap_or_default();
        self.base_envelope(MsgType::PeersList, payload, None)
    }

    fn make_ping(&mut self) -> Envelope {
        let ping_id = fresh_uuid(&mut self.rng);
        let seq = self.rng.gen_range(0..=1_000_000);
        self.base_envelope(
            MsgType::Ping,
            json!({"ping_id": ping_id, "seq": seq}),
            None,
        )
    }

    fn make_pong(&mut self, echo: PingPayload) -> Envelope {
        let payload = serde_json::to_value(echo).unwrap_or_default();
        self.base_envelope(MsgType::Pong, payload, None)
    }

    fn make_gossip(&mut self, topic: &str, data: String) -> Envelope {
        let origin_ts = self.clock.now_ms() as i64;
        let payload = json!({
            "topic": topic,
            "data": data,
            "origin_id": self.identity.node_id,
            "origin_timestamp_ms": origin_ts,
        });
        let ttl = self.cfg.ttl as i64;
        self.base_envelope(MsgType::Gossip, payload, Some(ttl))
    }

    fn make_ihave(&mut self, ids: Vec<String>) -> Envelope {
        let max_ids = self.cfg.ihave_max_ids;
        self.base_envelope(
            MsgType::Ihave,
            json!({"ids": ids, "max_ids": max_ids}),
            None,
        )
    }

    fn make_iwant(&mut self, ids: Vec<String>) -> Envelope {
        self.base_envelope(MsgType::Iwant, json!({"ids": ids}), None)
    }

    // -----------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------

    /// Decodes, validates, accounts, and routes one datagram.
    async fn handle_datagram(&mut self, data: &[u8], src: SocketAddr) {
        let env = match wire::decode(data) {
            Ok(env) => env,
            Err(wire::DecodeError::InvalidJson { reason }) => {
                self.log.log(
                    "recv_invalid_json",
                    json!({"peer": src.to_string(), "bytes": data.len(), "reason": reason}),
                );
                return;
            }
            Err(wire::DecodeError::InvalidSchema {
                reason,
                msg_type,
                msg_id,
            }) => {
                self.log.log(
                    "recv_invalid_schema",
                    json!({
                        "peer": src.to_string(),
                        "bytes": data.len(),
                        "reason": reason,
                        "msg_type": msg_type,
                        "msg_id": msg_id,
                    }),
                );
                return;
            }
        };

        self.log.log(
            "recv_ok",
            json!({
                "peer": src.to_string(),
                "bytes": data.len(),
                "msg_type": env.msg_type.clone(),
                "msg_id": env.msg_id.clone(),
            }),
        );

        // Any authenticated-enough sender refreshes the peer table, at
        // the datagram's source address. HELLO waits for the admission
        // check in its handler.
        if env.sender_id != self.identity.node_id && env.kind() != Some(MsgType::Hello) {
            self.observe_peer(src, &env.sender_id, false, "recv");
        }

        match env.kind() {
            Some(MsgType::Hello) => self.handle_hello(env, src).await,
            Some(MsgType::GetPeers) => self.handle_get_peers(env, src).await,
            Some(MsgType::PeersList) => self.handle_peers_list(env, src).await,
            Some(MsgType::Ping) => self.handle_ping(env, src).await,
            Some(MsgType::Pong) => self.handle_pong(env, src),
            Some(MsgType::Gossip) => self.handle_gossip(env, src).await,
            Some(MsgType::Ihave) => self.handle_ihave(env, src).await,
            Some(MsgType::Iwant) => self.handle_iwant(env, src).await,
            None => {
                self.log.log(
                    "recv_unknown_type",
                    json!({
                        "peer": src.to_string(),
                        "msg_type": env.msg_type,
                        "msg_id": env.msg_id,
                    }),
                );
            }
        }
    }

    /// Upserts a peer and emits the matching view-mutation event.
    fn observe_peer(&mut self, addr: SocketAddr, node_id: &str, verified: bool, reason: &str) {
        let now = self.clock.now_ms();
        match self.view.upsert(addr, Some(node_id), verified, now) {
            Upsert::Added { evicted } => {
                if let Some(victim) = evicted {
                    self.log.log(
                        "peer_evict",
                        json!({
                            "peer": victim.addr.to_string(),
                            "node_id": victim.node_id,
                            "reason": "capacity",
                        }),
                    );
                }
                self.log.log(
                    "peer_add",
                    json!({"peer": addr.to_string(), "node_id": node_id, "reason": reason}),
                );
            }
            Upsert::Updated => {
                self.log.log(
                    "peer_update",
                    json!({"peer": addr.to_string(), "node_id": node_id, "reason": reason}),
                );
            }
            // Full of healthy peers: admission silently ignored.
            Upsert::IgnoredCapacity | Upsert::IgnoredSelf => {}
        }
    }

    // -----------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------

    async fn handle_hello(&mut self, env: Envelope, src: SocketAddr) {
        let reject = |log: &EventLog, reason: &str| {
            log.log(
                "hello_rejected",
                json!({"peer": src.to_string(), "msg_id": env.msg_id.clone(), "reason": reason}),
            );
        };

        let payload: HelloPayload = match serde_json::from_value(env.payload.clone()) {
            Ok(p) => p,
            Err(_) => {
                reject(&self.log, "invalid_hello_payload");
                return;
            }
        };

        let has = |cap: &str| payload.capabilities.iter().any(|c| c == cap);
        if !REQUIRED_CAPABILITIES.iter().all(|cap| has(cap)) {
            reject(&self.log, "missing_capabilities");
            return;
        }

        if self.cfg.pow_k > 0 {
            let Some(cred) = payload.pow.as_ref() else {
                reject(&self.log, "pow_missing");
                return;
            };
            if let Err(e) = pow::verify(&env.sender_id, cred, self.cfg.pow_k) {
                reject(&self.log, &e.to_string());
                debug!(peer = %src, "rejected HELLO with bad proof-of-work");
                return;
            }
        }

        self.observe_peer(src, &env.sender_id, true, "hello");
        self.log.log(
            "hello_accepted",
            json!({"peer": src.to_string(), "msg_id": env.msg_id}),
        );

        let records = self.view.snapshot(self.cfg.peer_limit, Some(src));
        let count = records.len();
        let reply = self.make_peers_list(records);
        self.endpoint.send(&reply, src).await;
        self.log.log(
            "peers_list_sent",
            json!({"peer": src.to_string(), "count": count, "msg_id": reply.msg_id}),
        );
    }

    async fn handle_get_peers(&mut self, env: Envelope, src: SocketAddr) {
        let payload: GetPeersPayload =
            serde_json::from_value(env.payload.clone()).unwrap_or(GetPeersPayload { max_peers: None });
        let requested = payload
            .max_peers
            .map(|n| n as usize)
            .unwrap_or(self.cfg.peer_limit);
        let limit = requested.clamp(1, self.cfg.peer_limit);

        let records = self.view.snapshot(limit, Some(src));
        let count = records.len();
        let reply = self.make_peers_list(records);
        self.endpoint.send(&reply, src).await;
        self.log.log(
            "peers_list_sent",
            json!({"peer": src.to_string(), "count": count, "msg_id": reply.msg_id}),
        );
    }

    async fn handle_peers_list(&mut self, env: Envelope, src: SocketAddr) {
        let payload: PeersListPayload = match serde_json::from_value(env.payload.clone()) {
            Ok(p) => p,
            Err(_) => {
                self.log.log(
                    "recv_invalid_schema",
                    json!({
                        "peer": src.to_string(),
                        "reason": "invalid_peers_list_payload",
                        "msg_id": env.msg_id,
                    }),
                );
                return;
            }
        };

        self.log.log(
            "peers_list_received",
            json!({"peer": src.to_string(), "count": payload.peers.len()}),
        );

        let mut seen_addrs = std::collections::HashSet::new();
        let mut discovered = Vec::new();
        for record in &payload.peers {
            let Ok(addr) = record.addr.parse::<SocketAddr>() else {
                continue;
            };
            if record.node_id == self.identity.node_id || addr == self.identity.addr {
                continue;
            }
            if !seen_addrs.insert(addr) {
                continue;
            }
            let now = self.clock.now_ms();
            match self.view.upsert(addr, Some(&record.node_id), false, now) {
                Upsert::Added { evicted } => {
                    if let Some(victim) = evicted {
                        self.log.log(
                            "peer_evict",
                            json!({
                                "peer": victim.addr.to_string(),
                                "node_id": victim.node_id,
                                "reason": "capacity",
                            }),
                        );
                    }
                    self.log.log(
                        "peer_add",
                        json!({
                            "peer": addr.to_string(),
                            "node_id": record.node_id,
                            "reason": "peers_list",
                        }),
                    );
                    discovered.push(addr);
                }
                Upsert::Updated => {}
                Upsert::IgnoredCapacity | Upsert::IgnoredSelf => {}
            }
        }

        // Introduce ourselves to anyone we just learned about.
        for addr in discovered {
            let hello = self.make_hello();
            self.endpoint.send(&hello, addr).await;
        }
    }

    async fn handle_ping(&mut self, env: Envelope, src: SocketAddr) {
        let echo: PingPayload =
            serde_json::from_value(env.payload.clone()).unwrap_or_default();
        let pong = self.make_pong(echo);
        self.endpoint.send(&pong, src).await;
    }

    fn handle_pong(&mut self, _env: Envelope, src: SocketAddr) {
        self.view.reset_missed(&src);
    }

    async fn handle_gossip(&mut self, env: Envelope, src: SocketAddr) {
        // Schema validation guarantees a non-negative ttl on GOSSIP.
        let ttl = env.ttl.unwrap_or(0);
        if self.seen.contains(&env.msg_id) {
            debug!(msg_id = %env.msg_id, "duplicate gossip dropped");
            return;
        }
        self.seen.add(&env.msg_id);
        self.cache.put(&env.msg_id, env.clone());

        let payload: GossipPayload =
            serde_json::from_value(env.payload.clone()).unwrap_or_default();
        self.log.log(
            "gossip_first_seen",
            json!({
                "msg_id": env.msg_id.clone(),
                "from": src.to_string(),
                "at_ms": self.clock.now_ms(),
                "origin_ts": payload.origin_timestamp_ms,
                "topic": payload.topic,
                "data": payload.data,
            }),
        );

        if ttl <= 0 {
            return;
        }
        let mut forward = env.clone();
        forward.ttl = Some(ttl - 1);
        let targets = self
            .engine
            .forward_targets(&self.view, &mut self.rng, Some(&env.sender_id));
        for target in targets {
            self.endpoint.send(&forward, target).await;
        }
    }

    async fn handle_ihave(&mut self, env: Envelope, src: SocketAddr) {
        let payload: IhavePayload = match serde_json::from_value(env.payload.clone()) {
            Ok(p) => p,
            Err(_) => {
                self.log.log(
                    "recv_invalid_schema",
                    json!({
                        "peer": src.to_string(),
                        "reason": "invalid_ihave_payload",
                        "msg_id": env.msg_id,
                    }),
                );
                return;
            }
        };

        let unknown: Vec<String> = payload
            .ids
            .into_iter()
            .filter(|id| !self.seen.contains(id))
            .collect();
        if unknown.is_empty() {
            return;
        }
        debug!(peer = %src, count = unknown.len(), "requesting advertised gossip");
        let iwant = self.make_iwant(unknown);
        self.endpoint.send(&iwant, src).await;
    }

    async fn handle_iwant(&mut self, env: Envelope, src: SocketAddr) {
        let payload: IwantPayload = match serde_json::from_value(env.payload.clone()) {
            Ok(p) => p,
            Err(_) => {
                self.log.log(
                    "recv_invalid_schema",
                    json!({
                        "peer": src.to_string(),
                        "reason": "invalid_iwant_payload",
                        "msg_id": env.msg_id,
                    }),
                );
                return;
            }
        };

        for id in payload.ids {
            let Some(cached) = self.cache.get(&id).cloned() else {
                continue;
            };
            // Verbatim re-delivery: original fields, original ttl.
            self.endpoint.send(&cached, src).await;
        }
    }

    // -----------------------------------------------------------------
    // Periodic drivers
    // -----------------------------------------------------------------

    /// One ping-loop iteration: failure-detector sweep, then probe a
    /// fanout-sized random sample.
    async fn ping_tick(&mut self) {
        let now = self.clock.now_ms();
        for victim in self.view.expire(now) {
            self.log.log(
                "peer_evict",
                json!({
                    "peer": victim.addr.to_string(),
                    "node_id": victim.node_id,
                    "reason": "timeout",
                }),
            );
        }

        if self.view.is_empty() {
            return;
        }
        let targets = self.engine.batch_targets(&self.view, &mut self.rng);
        if targets.is_empty() {
            return;
        }
        let ping = self.make_ping();
        for target in targets {
            self.endpoint.send(&ping, target).await;
            self.view.mark_pinged(&target, now);
        }
    }

    /// One hybrid pull-loop iteration: advertise a random digest of the
    /// seen window to a fanout-sized sample.
    async fn pull_tick(&mut self) {
        if self.view.is_empty() || self.seen.is_empty() {
            return;
        }
        let ids = self.engine.digest_ids(&self.seen, &mut self.rng);
        let targets = self.engine.batch_targets(&self.view, &mut self.rng);
        if targets.is_empty() {
            return;
        }
        let ihave = self.make_ihave(ids);
        for target in targets {
            self.endpoint.send(&ihave, target).await;
        }
    }

    /// One discovery iteration: ask a random sample for their peers.
    async fn discovery_tick(&mut self) {
        if self.view.is_empty() {
            return;
        }
        let targets = self.engine.batch_targets(&self.view, &mut self.rng);
        for target in targets {
            let get_peers = self.make_get_peers(self.cfg.peer_limit);
            self.endpoint.send(&get_peers, target).await;
        }
    }

    /// Originates one application message: fresh id, configured TTL,
    /// ourselves as origin. The originator marks its own id seen and
    /// caches the body so it can answer IWANT for it.
    async fn originate(&mut self, data: String) {
        let env = self.make_gossip("user", data.clone());
        self.seen.add(&env.msg_id);
        self.cache.put(&env.msg_id, env.clone());
        self.log.log(
            "gossip_originated",
            json!({
                "msg_id": env.msg_id.clone(),
                "data": data,
                "at_ms": self.clock.now_ms(),
            }),
        );

        let targets = self.engine.forward_targets(&self.view, &mut self.rng, None);
        for target in targets {
            self.endpoint.send(&env, target).await;
        }
    }
}

/// An interval whose first tick fires one full period from now (the
/// loops sleep first, probe second). Disabled timers get an arbitrarily
/// long period; their select arm is also guarded off.
fn delayed_interval(period: Duration, enabled: bool) -> tokio::time::Interval {
    let period = if enabled && !period.is_zero() {
        period
    } else {
        Duration::from_secs(3600)
    };
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg() -> NodeConfig {
        let mut cfg = NodeConfig::new(0);
        cfg.stdin_enabled = false;
        cfg
    }

    async fn test_node(cfg: NodeConfig) -> NodeRuntime {
        NodeRuntime::bind(cfg, LogMode::Memory, Clock::manual(1_000))
            .await
            .unwrap()
    }

    fn gossip_from(sender: &str, msg_id: &str, ttl: i64) -> Vec<u8> {
        json!({
            "version": 1,
            "msg_id": msg_id,
            "msg_type": "GOSSIP",
            "sender_id": sender,
            "sender_addr": "127.0.0.1:0",
            "timestamp_ms": 500,
            "payload": {
                "topic": "user",
                "data": "x",
                "origin_id": sender,
                "origin_timestamp_ms": 500,
            },
            "ttl": ttl,
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn node_listening_reports_config() {
        let node = test_node(test_cfg()).await;
        let events = node.log_handle().events_named("node_listening");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["fanout"], 3);
        assert_eq!(events[0]["pull_interval"], 2.0);
        assert_eq!(events[0]["peer"], node.local_addr().to_string());
    }

    #[tokio::test]
    async fn invalid_json_is_logged_and_dropped() {
        let mut node = test_node(test_cfg()).await;
        let src = "127.0.0.1:41000".parse().unwrap();
        node.handle_datagram(b"{broken", src).await;

        let events = node.log_handle().events_named("recv_invalid_json");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["peer"], "127.0.0.1:41000");
    }

    #[tokio::test]
    async fn unknown_type_is_logged_and_dropped() {
        let mut node = test_node(test_cfg()).await;
        let src = "127.0.0.1:41000".parse().unwrap();
        let msg = json!({
            "version": 1,
            "msg_id": "m-1",
            "msg_type": "FROB",
            "sender_id": "n-1",
            "sender_addr": "127.0.0.1:41000",
            "timestamp_ms": 0,
            "payload": {},
        });
        node.handle_datagram(msg.to_string().as_bytes(), src).await;

        assert_eq!(node.log_handle().events_named("recv_unknown_type").len(), 1);
        // Sender of a well-formed message still enters the view.
        assert_eq!(node.peer_count(), 1);
    }

    #[tokio::test]
    async fn first_gossip_is_seen_and_cached_duplicate_dropped() {
        let mut node = test_node(test_cfg()).await;
        let src = "127.0.0.1:41000".parse().unwrap();

        node.handle_datagram(&gossip_from("n-1", "m-1", 0), src).await;
        node.handle_datagram(&gossip_from("n-1", "m-1", 0), src).await;

        let log = node.log_handle();
        let first_seen = log.events_named("gossip_first_seen");
        assert_eq!(first_seen.len(), 1);
        assert_eq!(first_seen[0]["msg_id"], "m-1");
        assert_eq!(first_seen[0]["from"], "127.0.0.1:41000");
        assert_eq!(first_seen[0]["origin_ts"], 500);
        assert!(node.seen.contains("m-1"));
        assert!(node.cache.get("m-1").is_some());
    }

    #[tokio::test]
    async fn gossip_with_positive_ttl_forwards_decremented() {
        let mut cfg = test_cfg();
        cfg.fanout = 4;
        let mut node = test_node(cfg).await;

        // A real peer to forward to, and the (fictional) gossip sender.
        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let now = node.clock.now_ms();
        node.view.upsert(peer_addr, Some("peer-1"), false, now);

        let src = "127.0.0.1:41000".parse().unwrap();
        node.handle_datagram(&gossip_from("n-1", "m-1", 3), src).await;

        let mut buf = vec![0u8; 4096];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        let forwarded = wire::decode(&buf[..len]).unwrap();
        assert_eq!(forwarded.msg_id, "m-1");
        assert_eq!(forwarded.ttl, Some(2));
        // Verbatim apart from ttl: previous hop's sender fields survive.
        assert_eq!(forwarded.sender_id, "n-1");
    }

    #[tokio::test]
    async fn gossip_with_zero_ttl_is_accepted_but_not_forwarded() {
        let mut node = test_node(test_cfg()).await;
        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let now = node.clock.now_ms();
        node.view.upsert(peer_addr, Some("peer-1"), false, now);

        let src = "127.0.0.1:41000".parse().unwrap();
        node.handle_datagram(&gossip_from("n-1", "m-1", 0), src).await;

        assert_eq!(node.log_handle().events_named("gossip_first_seen").len(), 1);
        // Only send accounting for GOSSIP forwards would show up here.
        let sends = node.log_handle().events_named("send_ok");
        assert!(sends.iter().all(|e| e["msg_type"] != "GOSSIP"));
    }

    #[tokio::test]
    async fn ping_is_answered_with_echoing_pong() {
        let mut node = test_node(test_cfg()).await;
        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let src = peer.local_addr().unwrap();

        let ping = json!({
            "version": 1,
            "msg_id": "m-ping",
            "msg_type": "PING",
            "sender_id": "n-1",
            "sender_addr": src.to_string(),
            "timestamp_ms": 0,
            "payload": {"ping_id": "p-7", "seq": 42},
        });
        node.handle_datagram(ping.to_string().as_bytes(), src).await;

        let mut buf = vec![0u8; 4096];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        let pong = wire::decode(&buf[..len]).unwrap();
        assert_eq!(pong.kind(), Some(MsgType::Pong));
        assert_eq!(pong.payload["ping_id"], "p-7");
        assert_eq!(pong.payload["seq"], 42);
    }

    #[tokio::test]
    async fn pong_resets_missed_pongs() {
        let mut node = test_node(test_cfg()).await;
        let src: SocketAddr = "127.0.0.1:41000".parse().unwrap();
        let now = node.clock.now_ms();
        node.view.upsert(src, Some("n-1"), false, now);
        node.view.mark_pinged(&src, now);
        node.clock.advance(7_000);
        node.view.expire(node.clock.now_ms());
        assert_eq!(node.view.get(&src).unwrap().missed_pongs, 1);

        let pong = json!({
            "version": 1,
            "msg_id": "m-pong",
            "msg_type": "PONG",
            "sender_id": "n-1",
            "sender_addr": src.to_string(),
            "timestamp_ms": 0,
            "payload": {"ping_id": "p-7", "seq": 42},
        });
        node.handle_datagram(pong.to_string().as_bytes(), src).await;
        assert_eq!(node.view.get(&src).unwrap().missed_pongs, 0);
    }

    #[tokio::test]
    async fn hello_without_required_capabilities_is_rejected() {
        let mut node = test_node(test_cfg()).await;
        let src = "127.0.0.1:41000".parse().unwrap();
        let hello = json!({
            "version": 1,
            "msg_id": "m-hello",
            "msg_type": "HELLO",
            "sender_id": "n-1",
            "sender_addr": "127.0.0.1:41000",
            "timestamp_ms": 0,
            "payload": {"capabilities": ["udp"]},
        });
        node.handle_datagram(hello.to_string().as_bytes(), src).await;

        let rejected = node.log_handle().events_named("hello_rejected");
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0]["reason"], "missing_capabilities");
        assert_eq!(node.peer_count(), 0);
    }

    #[tokio::test]
    async fn hello_with_bad_pow_is_rejected_without_side_effect() {
        let mut cfg = test_cfg();
        cfg.pow_k = 3;
        let mut node = test_node(cfg).await;
        let src = "127.0.0.1:41000".parse().unwrap();
        let hello = json!({
            "version": 1,
            "msg_id": "m-hello",
            "msg_type": "HELLO",
            "sender_id": "n-1",
            "sender_addr": "127.0.0.1:41000",
            "timestamp_ms": 0,
            "payload": {
                "capabilities": ["udp", "json"],
                "pow": {
                    "hash_alg": "sha256",
                    "difficulty_k": 3,
                    "nonce": 1,
                    "digest_hex": "ff00000000000000000000000000000000000000000000000000000000000000",
                },
            },
        });
        node.handle_datagram(hello.to_string().as_bytes(), src).await;

        let rejected = node.log_handle().events_named("hello_rejected");
        assert_eq!(rejected.len(), 1);
        assert!(rejected[0]["reason"].as_str().unwrap().starts_with("pow_"));
        assert_eq!(node.peer_count(), 0);
    }

    #[tokio::test]
    async fn valid_hello_is_accepted_and_answered_with_peers_list() {
        let mut cfg = test_cfg();
        cfg.pow_k = 1;
        let mut node = test_node(cfg).await;

        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let src = peer.local_addr().unwrap();
        let cred = pow::generate("n-1", 1);
        let hello = json!({
            "version": 1,
            "msg_id": "m-hello",
            "msg_type": "HELLO",
            "sender_id": "n-1",
            "sender_addr": src.to_string(),
            "timestamp_ms": 0,
            "payload": {
                "capabilities": ["udp", "json"],
                "pow": serde_json::to_value(&cred).unwrap(),
            },
        });
        node.handle_datagram(hello.to_string().as_bytes(), src).await;

        assert_eq!(node.log_handle().events_named("hello_accepted").len(), 1);
        assert!(node.view.get(&src).unwrap().verified_hello);

        let mut buf = vec![0u8; 4096];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        let reply = wire::decode(&buf[..len]).unwrap();
        assert_eq!(reply.kind(), Some(MsgType::PeersList));
    }

    #[tokio::test]
    async fn get_peers_snapshot_excludes_requester() {
        let mut node = test_node(test_cfg()).await;
        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let src = peer.local_addr().unwrap();
        let now = node.clock.now_ms();
        node.view.upsert(src, Some("asker"), false, now);
        node.view
            .upsert("127.0.0.1:41001".parse().unwrap(), Some("other"), false, now);

        let get_peers = json!({
            "version": 1,
            "msg_id": "m-gp",
            "msg_type": "GET_PEERS",
            "sender_id": "asker",
            "sender_addr": src.to_string(),
            "timestamp_ms": 0,
            "payload": {"max_peers": 10},
        });
        node.handle_datagram(get_peers.to_string().as_bytes(), src).await;

        let mut buf = vec![0u8; 4096];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        let reply = wire::decode(&buf[..len]).unwrap();
        let listing: PeersListPayload = serde_json::from_value(reply.payload).unwrap();
        assert_eq!(listing.peers.len(), 1);
        assert_eq!(listing.peers[0].node_id, "other");
    }

    #[tokio::test]
    async fn peers_list_upserts_and_greets_new_peers() {
        let mut node = test_node(test_cfg()).await;
        let newcomer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let newcomer_addr = newcomer.local_addr().unwrap();

        let src = "127.0.0.1:41000".parse().unwrap();
        let listing = json!({
            "version": 1,
            "msg_id": "m-pl",
            "msg_type": "PEERS_LIST",
            "sender_id": "n-1",
            "sender_addr": "127.0.0.1:41000",
            "timestamp_ms": 0,
            "payload": {"peers": [
                {"node_id": "fresh", "addr": newcomer_addr.to_string()},
                {"node_id": "fresh", "addr": newcomer_addr.to_string()},
                {"node_id": node.node_id(), "addr": node.local_addr().to_string()},
            ]},
        });
        node.handle_datagram(listing.to_string().as_bytes(), src).await;

        // Sender plus the (deduplicated) newcomer; never ourselves.
        assert_eq!(node.peer_count(), 2);
        assert_eq!(node.log_handle().events_named("peers_list_received").len(), 1);

        let mut buf = vec![0u8; 4096];
        let (len, _) = newcomer.recv_from(&mut buf).await.unwrap();
        let greeting = wire::decode(&buf[..len]).unwrap();
        assert_eq!(greeting.kind(), Some(MsgType::Hello));
    }

    #[tokio::test]
    async fn ihave_of_unseen_ids_triggers_iwant() {
        let mut node = test_node(test_cfg()).await;
        node.seen.add("m-known");

        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let src = peer.local_addr().unwrap();
        let ihave = json!({
            "version": 1,
            "msg_id": "m-ihave",
            "msg_type": "IHAVE",
            "sender_id": "n-1",
            "sender_addr": src.to_string(),
            "timestamp_ms": 0,
            "payload": {"ids": ["m-known", "m-new"], "max_ids": 32},
        });
        node.handle_datagram(ihave.to_string().as_bytes(), src).await;

        let mut buf = vec![0u8; 4096];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        let iwant = wire::decode(&buf[..len]).unwrap();
        assert_eq!(iwant.kind(), Some(MsgType::Iwant));
        assert_eq!(iwant.payload["ids"], json!(["m-new"]));
    }

    #[tokio::test]
    async fn ihave_of_only_known_ids_stays_silent() {
        let mut node = test_node(test_cfg()).await;
        node.seen.add("m-known");

        let src = "127.0.0.1:41000".parse().unwrap();
        let ihave = json!({
            "version": 1,
            "msg_id": "m-ihave",
            "msg_type": "IHAVE",
            "sender_id": "n-1",
            "sender_addr": "127.0.0.1:41000",
            "timestamp_ms": 0,
            "payload": {"ids": ["m-known"], "max_ids": 32},
        });
        node.handle_datagram(ihave.to_string().as_bytes(), src).await;

        let sends = node.log_handle().events_named("send_ok");
        assert!(sends.iter().all(|e| e["msg_type"] != "IWANT"));
    }

    #[tokio::test]
    async fn iwant_is_served_from_cache_verbatim() {
        let mut node = test_node(test_cfg()).await;
        let origin = "127.0.0.1:41000".parse().unwrap();
        node.handle_datagram(&gossip_from("n-1", "m-cached", 5), origin).await;

        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let src = peer.local_addr().unwrap();
        let iwant = json!({
            "version": 1,
            "msg_id": "m-iwant",
            "msg_type": "IWANT",
            "sender_id": "n-2",
            "sender_addr": src.to_string(),
            "timestamp_ms": 0,
            "payload": {"ids": ["m-cached", "m-unknown"]},
        });
        node.handle_datagram(iwant.to_string().as_bytes(), src).await;

        let mut buf = vec![0u8; 4096];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        let delivered = wire::decode(&buf[..len]).unwrap();
        assert_eq!(delivered.msg_id, "m-cached");
        // The cached body keeps the ttl it arrived with.
        assert_eq!(delivered.ttl, Some(5));
    }

    #[tokio::test]
    async fn origination_marks_seen_and_pushes() {
        let mut cfg = test_cfg();
        cfg.fanout = 2;
        let mut node = test_node(cfg).await;
        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let now = node.clock.now_ms();
        node.view.upsert(peer_addr, Some("peer-1"), false, now);

        node.originate("hello world".to_string()).await;

        let originated = node.log_handle().events_named("gossip_originated");
        assert_eq!(originated.len(), 1);
        assert_eq!(originated[0]["data"], "hello world");
        let msg_id = originated[0]["msg_id"].as_str().unwrap().to_string();
        assert!(node.seen.contains(&msg_id));
        assert!(node.cache.get(&msg_id).is_some());

        let mut buf = vec![0u8; 4096];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        let pushed = wire::decode(&buf[..len]).unwrap();
        assert_eq!(pushed.msg_id, msg_id);
        assert_eq!(pushed.ttl, Some(8));
        assert_eq!(pushed.sender_id, node.node_id());
    }

    #[tokio::test]
    async fn ping_tick_pings_and_stamps_sampled_peers() {
        let mut cfg = test_cfg();
        cfg.fanout = 8;
        let mut node = test_node(cfg).await;
        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let now = node.clock.now_ms();
        node.view.upsert(peer_addr, Some("peer-1"), false, now);

        node.ping_tick().await;

        let mut buf = vec![0u8; 4096];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        let ping = wire::decode(&buf[..len]).unwrap();
        assert_eq!(ping.kind(), Some(MsgType::Ping));
        assert!(node.view.get(&peer_addr).unwrap().last_ping_ms.is_some());
    }

    #[tokio::test]
    async fn pull_tick_advertises_seen_ids() {
        let mut node = test_node(test_cfg()).await;
        node.seen.add("m-1");
        node.seen.add("m-2");
        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let now = node.clock.now_ms();
        node.view.upsert(peer_addr, Some("peer-1"), false, now);

        node.pull_tick().await;

        let mut buf = vec![0u8; 4096];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        let ihave = wire::decode(&buf[..len]).unwrap();
        assert_eq!(ihave.kind(), Some(MsgType::Ihave));
        let payload: IhavePayload = serde_json::from_value(ihave.payload).unwrap();
        let mut ids = payload.ids;
        ids.sort();
        assert_eq!(ids, vec!["m-1", "m-2"]);
        assert_eq!(payload.max_ids, Some(32));
    }

    #[tokio::test]
    async fn pull_tick_with_empty_seen_set_is_silent() {
        let mut node = test_node(test_cfg()).await;
        let src: SocketAddr = "127.0.0.1:41000".parse().unwrap();
        let now = node.clock.now_ms();
        node.view.upsert(src, Some("peer-1"), false, now);

        node.pull_tick().await;
        assert!(node.log_handle().events_named("send_ok").is_empty());
    }

    #[tokio::test]
    async fn bootstrap_sends_hello_and_get_peers() {
        let seed = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let seed_addr = seed.local_addr().unwrap();
        let mut cfg = test_cfg();
        cfg.bootstrap = Some(seed_addr);
        let mut node = test_node(cfg).await;

        node.send_bootstrap().await;

        let log = node.log_handle();
        assert_eq!(log.events_named("bootstrap_hello_sent").len(), 1);
        assert_eq!(log.events_named("bootstrap_get_peers_sent").len(), 1);

        let mut buf = vec![0u8; 4096];
        let (len, _) = seed.recv_from(&mut buf).await.unwrap();
        assert_eq!(wire::decode(&buf[..len]).unwrap().kind(), Some(MsgType::Hello));
        let (len, _) = seed.recv_from(&mut buf).await.unwrap();
        assert_eq!(
            wire::decode(&buf[..len]).unwrap().kind(),
            Some(MsgType::GetPeers)
        );
    }

    #[tokio::test]
    async fn peer_limit_is_never_exceeded() {
        let mut cfg = test_cfg();
        cfg.peer_limit = 3;
        let mut node = test_node(cfg).await;

        for port in 41000..41010u16 {
            let src: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
            let ping = json!({
                "version": 1,
                "msg_id": format!("m-{port}"),
                "msg_type": "PING",
                "sender_id": format!("n-{port}"),
                "sender_addr": src.to_string(),
                "timestamp_ms": 0,
                "payload": {},
            });
            node.handle_datagram(ping.to_string().as_bytes(), src).await;
            assert!(node.peer_count() <= 3);
        }
    }
}
