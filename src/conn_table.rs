//! Flow-keyed TCP connection tracking.
//!
//! Keeps per-flow state with the origin direction remembered from the first
//! SYN, per-state idle timeouts with a background sweep, fixed-window SYN/RST
//! counters per source IP, and a temporary shun list. All four maps live
//! behind a single mutex; holders never perform I/O.

use crate::config::{FloodConfig, TableConfig};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Compact IPv4 key for per-IP counters and shuns.
pub type Ip4 = [u8; 4];

// =============================================================================
// STATES AND KEYS
// =============================================================================

/// Simplified RFC 793 connection state as tracked by the firewall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TcpState {
    Closed,
    SynSent,
    SynRecv,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    LastAck,
    TimeWait,
}

impl TcpState {
    /// Half-open means the three-way handshake has not completed.
    pub fn is_half_open(&self) -> bool {
        matches!(self, TcpState::SynSent | TcpState::SynRecv)
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TcpState::Closed => "CLOSED",
            TcpState::SynSent => "SYN_SENT",
            TcpState::SynRecv => "SYN_RECV",
            TcpState::Established => "ESTABLISHED",
            TcpState::FinWait1 => "FIN_WAIT1",
            TcpState::FinWait2 => "FIN_WAIT2",
            TcpState::CloseWait => "CLOSE_WAIT",
            TcpState::LastAck => "LAST_ACK",
            TcpState::TimeWait => "TIME_WAIT",
        };
        f.write_str(s)
    }
}

/// Directional 4-tuple identifying a flow as observed src -> dst.
///
/// Keys are never canonicalized: direction carries meaning, and lookup
/// tries both orientations instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_ip: Ip4,
    pub dst_ip: Ip4,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn new(src_ip: Ip4, dst_ip: Ip4, src_port: u16, dst_port: u16) -> Self {
        Self {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
        }
    }

    /// The same flow seen from the other side.
    pub fn reversed(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            Ipv4Addr::from(self.src_ip),
            self.src_port,
            Ipv4Addr::from(self.dst_ip),
            self.dst_port
        )
    }
}

/// Per-flow record. `origin` is the exact key observed on the first SYN and
/// never changes afterwards.
#[derive(Debug, Clone)]
struct ConnEntry {
    state: TcpState,
    origin: FlowKey,
    last_seen: Instant,
}

/// Fixed-window event counter: start of the current window plus the count
/// inside it. No sliding, no decay.
#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    start: Instant,
    count: u32,
}

// =============================================================================
// DECISIONS
// =============================================================================

/// Outcome of consulting the state machine for one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub accept: bool,
    pub reason: &'static str,
    pub state: TcpState,
}

impl Decision {
    fn accept(reason: &'static str, state: TcpState) -> Self {
        Self {
            accept: true,
            reason,
            state,
        }
    }

    fn drop(reason: &'static str, state: TcpState) -> Self {
        Self {
            accept: false,
            reason,
            state,
        }
    }
}

/// Outcome of accounting one initial SYN against the flood limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynGate {
    /// Under all limits.
    Clear,
    /// Over the per-IP limit, or the global half-open cap is reached.
    Flood,
    /// Over four times the per-IP limit; the source was just shunned.
    Banned,
}

/// How one packet moves an existing entry.
enum Step {
    Set(TcpState, &'static str),
    Touch(&'static str),
    Delete(&'static str),
}

// =============================================================================
// STATE TABLE
// =============================================================================

struct Inner {
    flows: HashMap<FlowKey, ConnEntry>,
    syn_by_src: HashMap<Ip4, WindowCounter>,
    rst_by_src: HashMap<Ip4, WindowCounter>,
    banned: HashMap<Ip4, Instant>,
}

impl Inner {
    fn half_open(&self) -> u32 {
        self.flows
            .values()
            .filter(|e| e.state.is_half_open())
            .count() as u32
    }

    /// Reports whether src is currently shunned, evicting an expired ban.
    fn is_banned(&mut self, src: Ip4, now: Instant) -> bool {
        let Some(&until) = self.banned.get(&src) else {
            return false;
        };
        if now < until {
            return true;
        }
        self.banned.remove(&src);
        false
    }
}

/// Bump a per-key counter in a fixed window, returning the in-window count.
fn bump_window(
    map: &mut HashMap<Ip4, WindowCounter>,
    key: Ip4,
    window: Duration,
    now: Instant,
) -> u32 {
    match map.get_mut(&key) {
        Some(wc) if now.duration_since(wc.start) < window => {
            wc.count += 1;
            wc.count
        }
        _ => {
            map.insert(key, WindowCounter { start: now, count: 1 });
            1
        }
    }
}

/// All flows plus timeouts and flood-control knobs. Safe for concurrent use.
pub struct StateTable {
    inner: Mutex<Inner>,
    timeouts: TableConfig,
    flood: FloodConfig,
    /// Times the table mutex was recovered after a holder panicked.
    poison_recoveries: AtomicU64,
}

impl StateTable {
    pub fn new(timeouts: TableConfig, flood: FloodConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                flows: HashMap::new(),
                syn_by_src: HashMap::new(),
                rst_by_src: HashMap::new(),
                banned: HashMap::new(),
            }),
            timeouts,
            flood,
            poison_recoveries: AtomicU64::new(0),
        }
    }

    /// Flood thresholds this table enforces.
    pub fn flood_config(&self) -> &FloodConfig {
        &self.flood
    }

    /// Acquire the table mutex, recovering if a transport worker or the
    /// sweeper panicked while holding it. Every packet must still get a
    /// verdict, so processing continues on the recovered maps; each recovery
    /// is counted and surfaced in the snapshot.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                self.poison_recoveries.fetch_add(1, Ordering::Relaxed);
                error!("state table mutex poisoned - continuing on recovered maps");
                poisoned.into_inner()
            }
        }
    }

    // =========================================================================
    // STATE MACHINE
    // =========================================================================

    /// Consult and update the state machine for one packet.
    ///
    /// New flows must start with a bare SYN; a packet with no matching entry
    /// and no initiating SYN is the one thing this component drops.
    #[allow(clippy::too_many_arguments)]
    pub fn decide(
        &self,
        src_ip: Ip4,
        dst_ip: Ip4,
        src_port: u16,
        dst_port: u16,
        syn: bool,
        ack: bool,
        fin: bool,
        rst: bool,
    ) -> Decision {
        self.decide_at(
            Instant::now(),
            FlowKey::new(src_ip, dst_ip, src_port, dst_port),
            syn,
            ack,
            fin,
            rst,
        )
    }

    fn decide_at(
        &self,
        now: Instant,
        key: FlowKey,
        syn: bool,
        ack: bool,
        fin: bool,
        rst: bool,
    ) -> Decision {
        let rev = key.reversed();
        let mut inner = self.lock();

        // Find the stored orientation, trying both directions.
        let stored = if inner.flows.contains_key(&key) {
            key
        } else if inner.flows.contains_key(&rev) {
            rev
        } else {
            // No entry yet: only an initial SYN (no ACK) may create state.
            if syn && !ack {
                inner.flows.insert(
                    key,
                    ConnEntry {
                        state: TcpState::SynSent,
                        origin: key,
                        last_seen: now,
                    },
                );
                return Decision::accept("new->SYN_SENT", TcpState::SynSent);
            }
            return Decision::drop("no-state-not-SYN", TcpState::Closed);
        };

        let (state, origin) = match inner.flows.get(&stored) {
            Some(e) => (e.state, e.origin),
            None => return Decision::drop("no-state-not-SYN", TcpState::Closed),
        };
        let dir_is_origin = origin == key;

        let step = match state {
            TcpState::SynSent if !dir_is_origin && syn && ack => {
                Step::Set(TcpState::SynRecv, "SYN_SENT->SYN_RECV")
            }
            // Retransmits / simultaneous open: accept but keep state.
            TcpState::SynSent => Step::Touch("SYN_SENT(other)"),

            TcpState::SynRecv if dir_is_origin && ack && !syn => {
                Step::Set(TcpState::Established, "SYN_RECV->ESTABLISHED")
            }
            TcpState::SynRecv => Step::Touch("SYN_RECV(other)"),

            TcpState::Established if rst => Step::Delete("ESTABLISHED->CLOSED(RST)"),
            TcpState::Established if fin && dir_is_origin => {
                Step::Set(TcpState::FinWait1, "ESTABLISHED->FIN_WAIT1")
            }
            TcpState::Established if fin => {
                Step::Set(TcpState::CloseWait, "ESTABLISHED->CLOSE_WAIT")
            }
            TcpState::Established => Step::Touch("ESTABLISHED(data/ack)"),

            TcpState::FinWait1 if !dir_is_origin && ack && !fin => {
                Step::Set(TcpState::FinWait2, "FIN_WAIT1->FIN_WAIT2")
            }
            TcpState::FinWait1 if !dir_is_origin && fin => {
                Step::Set(TcpState::TimeWait, "FIN_WAIT1->TIME_WAIT")
            }
            TcpState::FinWait1 => Step::Touch("FIN_WAIT1(other)"),

            TcpState::FinWait2 if !dir_is_origin && fin => {
                Step::Set(TcpState::TimeWait, "FIN_WAIT2->TIME_WAIT")
            }
            TcpState::FinWait2 => Step::Touch("FIN_WAIT2(other)"),

            TcpState::CloseWait if dir_is_origin && fin => {
                Step::Set(TcpState::LastAck, "CLOSE_WAIT->LAST_ACK")
            }
            TcpState::CloseWait => Step::Touch("CLOSE_WAIT(other)"),

            TcpState::LastAck if !dir_is_origin && ack => Step::Delete("LAST_ACK->CLOSED"),
            TcpState::LastAck => Step::Touch("LAST_ACK(other)"),

            // Allow during TIME_WAIT; the sweep removes it later.
            TcpState::TimeWait => Step::Touch("TIME_WAIT"),

            // Entries are never stored in CLOSED; accept and refresh.
            TcpState::Closed => Step::Touch("default"),
        };

        match step {
            Step::Set(next, reason) => {
                if let Some(e) = inner.flows.get_mut(&stored) {
                    e.state = next;
                    e.last_seen = now;
                }
                Decision::accept(reason, next)
            }
            Step::Touch(reason) => {
                if let Some(e) = inner.flows.get_mut(&stored) {
                    e.last_seen = now;
                }
                Decision::accept(reason, state)
            }
            Step::Delete(reason) => {
                inner.flows.remove(&key);
                inner.flows.remove(&rev);
                Decision::accept(reason, TcpState::Closed)
            }
        }
    }

    /// Best-effort read of a flow's current state, trying both directions.
    pub fn peek_state(&self, src_ip: Ip4, dst_ip: Ip4, src_port: u16, dst_port: u16) -> Option<TcpState> {
        let key = FlowKey::new(src_ip, dst_ip, src_port, dst_port);
        let inner = self.lock();
        inner
            .flows
            .get(&key)
            .or_else(|| inner.flows.get(&key.reversed()))
            .map(|e| e.state)
    }

    // =========================================================================
    // FLOOD CONTROL
    // =========================================================================

    /// Reports whether src is currently shunned.
    pub fn is_banned(&self, src: Ip4) -> bool {
        self.is_banned_at(Instant::now(), src)
    }

    fn is_banned_at(&self, now: Instant, src: Ip4) -> bool {
        let mut inner = self.lock();
        inner.is_banned(src, now)
    }

    /// Shun a source until `duration` from now.
    pub fn ban(&self, src: Ip4, duration: Duration) {
        let mut inner = self.lock();
        inner.banned.insert(src, Instant::now() + duration);
        info!("shunned {} for {:?}", Ipv4Addr::from(src), duration);
    }

    /// Account one initial SYN from src against the per-IP window and the
    /// global half-open cap. Bump and check happen under one lock acquisition.
    pub fn register_syn(&self, src: Ip4) -> SynGate {
        self.register_syn_at(Instant::now(), src)
    }

    fn register_syn_at(&self, now: Instant, src: Ip4) -> SynGate {
        let mut inner = self.lock();

        let count = bump_window(&mut inner.syn_by_src, src, self.flood.syn_window(), now);
        if count > self.flood.ban_trigger() {
            inner.banned.insert(src, now + self.flood.ban_duration());
            info!(
                "shunned {} for {:?} ({} SYNs in window)",
                Ipv4Addr::from(src),
                self.flood.ban_duration(),
                count
            );
            return SynGate::Banned;
        }

        let half_open = inner.half_open();
        if count > self.flood.syn_per_ip_limit || half_open >= self.flood.global_half_open_limit {
            return SynGate::Flood;
        }
        SynGate::Clear
    }

    /// Account one RST from src; true means the source is over its limit.
    pub fn register_rst(&self, src: Ip4) -> bool {
        self.register_rst_at(Instant::now(), src)
    }

    fn register_rst_at(&self, now: Instant, src: Ip4) -> bool {
        let mut inner = self.lock();
        let count = bump_window(&mut inner.rst_by_src, src, self.flood.rst_window(), now);
        count > self.flood.rst_per_ip_limit
    }

    /// Number of flows still in the handshake.
    pub fn half_open_count(&self) -> u32 {
        let inner = self.lock();
        inner.half_open()
    }

    /// Number of tracked flows.
    pub fn flow_count(&self) -> usize {
        let inner = self.lock();
        inner.flows.len()
    }

    // =========================================================================
    // EXPIRY SWEEP
    // =========================================================================

    fn timeout_for(&self, state: TcpState) -> Duration {
        match state {
            TcpState::SynSent | TcpState::SynRecv => self.timeouts.syn_timeout(),
            TcpState::FinWait1 | TcpState::FinWait2 | TcpState::CloseWait | TcpState::LastAck => {
                self.timeouts.fin_timeout()
            }
            TcpState::TimeWait => self.timeouts.time_wait_timeout(),
            _ => self.timeouts.established_timeout(),
        }
    }

    /// Remove flows idle past their state-class timeout, and expired bans.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    fn sweep_at(&self, now: Instant) {
        let mut inner = self.lock();

        let flows_before = inner.flows.len();
        inner
            .flows
            .retain(|_, e| now.duration_since(e.last_seen) <= self.timeout_for(e.state));
        let removed_flows = flows_before - inner.flows.len();

        let bans_before = inner.banned.len();
        inner.banned.retain(|_, &mut until| now < until);
        let removed_bans = bans_before - inner.banned.len();

        if removed_flows > 0 || removed_bans > 0 {
            debug!(
                "sweep removed {} stale flows, {} expired bans",
                removed_flows, removed_bans
            );
        }
    }

    /// Run the sweep on its own task at the configured cadence.
    pub fn spawn_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        let cadence = self.timeouts.sweep_interval();
        info!("starting expiry sweep (interval: {:?})", cadence);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cadence);
            loop {
                ticker.tick().await;
                self.sweep();
            }
        })
    }

    // =========================================================================
    // SNAPSHOT
    // =========================================================================

    /// Point-in-time deep copy of the table and counters for the monitor.
    /// No references to internal state escape.
    pub fn snapshot(&self) -> TableSnapshot {
        let now = Instant::now();
        let inner = self.lock();

        let mut states: HashMap<String, usize> = HashMap::new();
        let mut entries = Vec::with_capacity(inner.flows.len());
        let mut half_open = 0u32;

        for (key, e) in &inner.flows {
            if e.state.is_half_open() {
                half_open += 1;
            }
            *states.entry(e.state.to_string()).or_insert(0) += 1;
            entries.push(FlowSnapshot {
                src: format!("{}:{}", Ipv4Addr::from(key.src_ip), key.src_port),
                dst: format!("{}:{}", Ipv4Addr::from(key.dst_ip), key.dst_port),
                state: e.state.to_string(),
                idle_secs: now.duration_since(e.last_seen).as_secs(),
                is_origin: e.origin == *key,
            });
        }

        let syn_by_src = inner
            .syn_by_src
            .iter()
            .map(|(ip, wc)| (Ipv4Addr::from(*ip).to_string(), wc.count))
            .collect();
        let rst_by_src = inner
            .rst_by_src
            .iter()
            .map(|(ip, wc)| (Ipv4Addr::from(*ip).to_string(), wc.count))
            .collect();
        let banned = inner
            .banned
            .iter()
            .map(|(ip, until)| {
                (
                    Ipv4Addr::from(*ip).to_string(),
                    until.saturating_duration_since(now).as_secs(),
                )
            })
            .collect();

        TableSnapshot {
            now_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            total: inner.flows.len(),
            half_open,
            states,
            entries,
            syn_by_src,
            rst_by_src,
            banned,
            poison_recoveries: self.poison_recoveries.load(Ordering::Relaxed),
            limits: LimitSnapshot {
                syn_per_ip_limit: self.flood.syn_per_ip_limit,
                syn_window_ms: self.flood.syn_window_ms,
                rst_per_ip_limit: self.flood.rst_per_ip_limit,
                rst_window_ms: self.flood.rst_window_ms,
                global_half_open_limit: self.flood.global_half_open_limit,
                ban_duration_secs: self.flood.ban_duration_secs,
                syn_timeout_secs: self.timeouts.syn_timeout_secs,
                established_timeout_secs: self.timeouts.established_timeout_secs,
                fin_timeout_secs: self.timeouts.fin_timeout_secs,
                time_wait_timeout_secs: self.timeouts.time_wait_timeout_secs,
            },
        }
    }
}

// =============================================================================
// SNAPSHOT TYPES
// =============================================================================

/// One rendered flow entry.
#[derive(Debug, Clone, Serialize)]
pub struct FlowSnapshot {
    pub src: String,
    pub dst: String,
    pub state: String,
    pub idle_secs: u64,
    pub is_origin: bool,
}

/// The configured thresholds, echoed for the monitor page.
#[derive(Debug, Clone, Serialize)]
pub struct LimitSnapshot {
    pub syn_per_ip_limit: u32,
    pub syn_window_ms: u64,
    pub rst_per_ip_limit: u32,
    pub rst_window_ms: u64,
    pub global_half_open_limit: u32,
    pub ban_duration_secs: u64,
    pub syn_timeout_secs: u64,
    pub established_timeout_secs: u64,
    pub fin_timeout_secs: u64,
    pub time_wait_timeout_secs: u64,
}

/// Owned copy of the table for rendering/JSON.
#[derive(Debug, Clone, Serialize)]
pub struct TableSnapshot {
    pub now_unix: u64,
    pub total: usize,
    pub half_open: u32,
    pub states: HashMap<String, usize>,
    pub entries: Vec<FlowSnapshot>,
    pub syn_by_src: HashMap<String, u32>,
    pub rst_by_src: HashMap<String, u32>,
    /// Seconds until each shun expires.
    pub banned: HashMap<String, u64>,
    /// Times the table lock was recovered after a panicking holder.
    pub poison_recoveries: u64,
    pub limits: LimitSnapshot,
}

// =============================================================================
// TESTS
// =============================================================================
