//! Heartbeat-driven membership service.
//!
//! # Responsibilities
//! - Broadcast the local member record at a fixed interval over UDP
//! - Receive heartbeats and maintain the [`MembershipTable`]
//! - Evict stale members and notify listeners exactly once per change
//! - Introduce known members to peers so seeded clusters become fully meshed
//! - Announce departure with a leave notice on stop
//!
//! # Data Flow
//! ```text
//! heartbeat_loop ──tick──► encode ──► seeds ∪ members ∪ introduced ∪ multicast
//!                  └──────► check_expired
//! receive_loop ──datagram──► decode ──► table.observe ──► listeners
//!                             │   └───► known addrs ──► introduced
//!                             └─bad──► warn + discard
//! ```
//!
//! # Design Decisions
//! - Heartbeats are best effort: send failures are logged, never retried
//! - A malformed datagram never stops the receive loop
//! - Eviction is opportunistic: every send, receive and tick checks staleness
//! - Introductions only add heartbeat targets; a member enters the table
//!   only when its own heartbeat arrives

use dashmap::DashMap;
use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::config::MembershipConfig;
use crate::lifecycle::{Shutdown, ShutdownSignal};
use crate::membership::heartbeat::Heartbeat;
use crate::membership::member::Member;
use crate::membership::table::{MembershipTable, Observed};
use crate::observability::metrics;

const MAX_DATAGRAM: usize = 64 * 1024;
const RECV_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Notified when members join or leave the view.
pub trait MembershipListener: Send + Sync + 'static {
    fn member_added(&self, member: &Member);
    fn member_disappeared(&self, member: &Member);
}

/// Fatal membership startup errors.
#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("invalid {field} address: {value}")]
    Address { field: &'static str, value: String },
    #[error("failed to bind heartbeat socket: {0}")]
    Bind(#[source] io::Error),
    #[error("failed to join multicast group {group}: {source}")]
    Multicast {
        group: Ipv4Addr,
        #[source]
        source: io::Error,
    },
}

/// A running membership service.
pub struct MembershipService {
    socket: Arc<UdpSocket>,
    local: Member,
    table: MembershipTable,
    seeds: Vec<SocketAddr>,
    /// Heartbeat addresses learned from other members, by local time learned.
    introduced: DashMap<SocketAddr, Instant>,
    multicast: Option<SocketAddr>,
    interval: Duration,
    listeners: RwLock<Vec<Arc<dyn MembershipListener>>>,
    shutdown: Shutdown,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MembershipService {
    /// Bind the heartbeat socket. The local member's UDP port is set to the
    /// port actually bound.
    pub async fn bind(config: &MembershipConfig, mut local: Member) -> Result<Arc<Self>, MembershipError> {
        let bind_addr = parse_addr("membership.bind_address", &config.bind_address)?;
        let seeds = config
            .peers
            .iter()
            .map(|peer| parse_addr("membership.peers", peer))
            .collect::<Result<Vec<_>, _>>()?;

        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(MembershipError::Bind)?;
        let bound = socket.local_addr().map_err(MembershipError::Bind)?;

        let multicast = match &config.multicast_group {
            Some(group) => {
                let group: Ipv4Addr = group.parse().map_err(|_| MembershipError::Address {
                    field: "membership.multicast_group",
                    value: group.clone(),
                })?;
                socket
                    .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
                    .and_then(|_| socket.set_multicast_ttl_v4(config.multicast_ttl))
                    .map_err(|source| MembershipError::Multicast { group, source })?;
                Some(SocketAddr::new(IpAddr::V4(group), bound.port()))
            }
            None => None,
        };

        local.udp_port = Some(bound.port());
        tracing::info!(
            member = %local,
            udp_address = %bound,
            seeds = seeds.len(),
            multicast = ?multicast,
            "Membership socket bound"
        );

        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            table: MembershipTable::new(local.id, config.expiration()),
            local,
            seeds,
            introduced: DashMap::new(),
            multicast,
            interval: config.heartbeat_interval(),
            listeners: RwLock::new(Vec::new()),
            shutdown: Shutdown::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Register a listener. Listeners added after start only see later events.
    pub fn add_listener(&self, listener: Arc<dyn MembershipListener>) {
        self.listeners
            .write()
            .expect("membership listeners poisoned")
            .push(listener);
    }

    /// Spawn the heartbeat and receive loops.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().expect("membership task list poisoned");

        let service = self.clone();
        let signal = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            service.heartbeat_loop(signal).await;
        }));

        let service = self.clone();
        let signal = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            service.receive_loop(signal).await;
        }));

        tracing::info!(
            member = %self.local.id,
            interval_ms = self.interval.as_millis() as u64,
            expiration_ms = self.table.expiration().as_millis() as u64,
            "Membership service started"
        );
    }

    /// Stop both loops, then send a leave notice. Idempotent.
    ///
    /// The heartbeat loop is joined first so no alive heartbeat can follow
    /// the leave notice.
    pub async fn stop(&self) {
        if self.shutdown.is_triggered() {
            return;
        }
        self.shutdown.trigger();
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .expect("membership task list poisoned")
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Membership task failed");
            }
        }

        let leave = Heartbeat::leaving(self.local.clone()).encode();
        for target in self.targets() {
            if let Err(e) = self.socket.send_to(&leave, target).await {
                tracing::debug!(target = %target, error = %e, "Leave notice not sent");
            }
        }
        tracing::info!(member = %self.local.id, "Membership service stopped");
    }

    pub fn local_member(&self) -> &Member {
        &self.local
    }

    pub fn udp_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Live members, excluding the local one.
    pub fn members(&self) -> Vec<Member> {
        self.table.members()
    }

    pub fn table(&self) -> &MembershipTable {
        &self.table
    }

    /// Evict stale members now and notify listeners. Returns the evicted members.
    pub fn check_expired(&self) -> Vec<Member> {
        let now = Instant::now();
        let expiration = self.table.expiration();
        self.introduced
            .retain(|_, learned| now.saturating_duration_since(*learned) <= expiration);

        let evicted = self.table.expire(now);
        for member in &evicted {
            tracing::info!(member = %member, "Member expired");
            metrics::record_member_event("expired");
            self.notify_disappeared(member);
        }
        if !evicted.is_empty() {
            metrics::set_member_count(self.table.len());
        }
        evicted
    }

    /// Send one heartbeat to every current target.
    pub async fn send_heartbeat(&self) {
        let known: Vec<SocketAddr> = self
            .table
            .members()
            .iter()
            .filter_map(Member::udp_address)
            .collect();
        let datagram = Heartbeat::alive(self.local.clone())
            .with_known(known)
            .encode();
        for target in self.targets() {
            if let Err(e) = self.socket.send_to(&datagram, target).await {
                tracing::debug!(target = %target, error = %e, "Heartbeat send failed");
            }
        }
    }

    fn targets(&self) -> Vec<SocketAddr> {
        let own = self.local.udp_address();
        let members = self.table.members();
        let introduced: Vec<SocketAddr> = self.introduced.iter().map(|e| *e.key()).collect();
        let mut seen = HashSet::new();
        self.seeds
            .iter()
            .copied()
            .chain(members.iter().filter_map(Member::udp_address))
            .chain(introduced)
            .chain(self.multicast)
            .filter(|addr| Some(*addr) != own && seen.insert(*addr))
            .collect()
    }

    fn introduce(&self, known: &[SocketAddr]) {
        let now = Instant::now();
        let own = self.socket.local_addr().ok();
        for addr in known {
            if Some(*addr) != own && !addr.ip().is_unspecified() {
                self.introduced.insert(*addr, now);
            }
        }
    }

    /// Apply one received datagram.
    pub fn handle_datagram(&self, bytes: &[u8], from: SocketAddr) {
        match Heartbeat::decode(bytes) {
            Ok(mut heartbeat) => {
                if heartbeat.member.host.is_unspecified() {
                    heartbeat.member.host = from.ip();
                }
                if heartbeat.alive {
                    self.introduce(&heartbeat.known);
                }
                self.apply(heartbeat);
            }
            Err(e) => {
                metrics::record_decode_error("heartbeat");
                tracing::warn!(source_addr = %from, error = %e, "Discarding malformed heartbeat");
            }
        }
        self.check_expired();
    }

    fn apply(&self, heartbeat: Heartbeat) {
        match self.table.observe(heartbeat, Instant::now()) {
            Observed::Added(member) => {
                tracing::info!(member = %member, "Member added");
                metrics::record_member_event("added");
                metrics::set_member_count(self.table.len());
                for listener in self.listeners() {
                    listener.member_added(&member);
                }
            }
            Observed::Left(member) => {
                tracing::info!(member = %member, "Member left");
                metrics::record_member_event("left");
                metrics::set_member_count(self.table.len());
                self.notify_disappeared(&member);
            }
            Observed::Refreshed | Observed::Ignored => {}
        }
    }

    fn notify_disappeared(&self, member: &Member) {
        for listener in self.listeners() {
            listener.member_disappeared(member);
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn MembershipListener>> {
        self.listeners
            .read()
            .expect("membership listeners poisoned")
            .clone()
    }

    async fn heartbeat_loop(&self, mut shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.send_heartbeat().await;
                    self.check_expired();
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    async fn receive_loop(&self, mut shutdown: ShutdownSignal) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let received = tokio::select! {
                received = self.socket.recv_from(&mut buf) => received,
                _ = shutdown.recv() => break,
            };
            match received {
                Ok((len, from)) => self.handle_datagram(&buf[..len], from),
                Err(e) => {
                    // Unreachable-port ICMP errors surface here on some platforms.
                    tracing::debug!(error = %e, "Heartbeat receive failed");
                    tokio::select! {
                        _ = tokio::time::sleep(RECV_ERROR_PAUSE) => {}
                        _ = shutdown.recv() => break,
                    }
                }
            }
        }
    }
}

fn parse_addr(field: &'static str, value: &str) -> Result<SocketAddr, MembershipError> {
    value.parse().map_err(|_| MembershipError::Address {
        field,
        value: value.to_string(),
    })
}
