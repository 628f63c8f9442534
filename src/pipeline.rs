//! The layered decision pipeline.
//!
//! Filters run in a fixed order and short-circuit on the first drop. New
//! rules slot into the chain without touching the evaluation loop. Exactly
//! one verdict comes out per packet, and no filter performs I/O.

use crate::conn_table::{StateTable, SynGate, TcpState};
use crate::flags::invalid_tcp_flags;
use crate::packet::{decode, Decoded, PacketView};
use crate::stats::PipelineStats;
use std::sync::Arc;
use tracing::debug;

/// Final ACCEPT/DROP answer for one packet, with a stable reason token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub accept: bool,
    pub reason: &'static str,
}

impl Verdict {
    pub const fn accept(reason: &'static str) -> Self {
        Self {
            accept: true,
            reason,
        }
    }

    pub const fn drop(reason: &'static str) -> Self {
        Self {
            accept: false,
            reason,
        }
    }
}

/// What one filter says about a packet.
pub enum FilterAction {
    /// No opinion; ask the next filter.
    Continue,
    /// Terminal accept.
    Accept(&'static str),
    /// Terminal drop.
    Drop(&'static str),
}

/// One rule in the chain.
pub trait PacketFilter: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, pkt: &PacketView, table: &StateTable) -> FilterAction;
}

// =============================================================================
// FILTERS
// =============================================================================

/// Rejects illegal flag combinations before any state is consulted.
pub struct FlagSanity;

impl PacketFilter for FlagSanity {
    fn name(&self) -> &'static str {
        "flag-sanity"
    }

    fn apply(&self, pkt: &PacketView, _table: &StateTable) -> FilterAction {
        if invalid_tcp_flags(&pkt.flags, pkt.data_offset) {
            FilterAction::Drop("invalid-flags")
        } else {
            FilterAction::Continue
        }
    }
}

/// Drops everything from currently shunned sources.
pub struct ShunList;

impl PacketFilter for ShunList {
    fn name(&self) -> &'static str {
        "shun-list"
    }

    fn apply(&self, pkt: &PacketView, table: &StateTable) -> FilterAction {
        if table.is_banned(pkt.src_ip) {
            FilterAction::Drop("banned")
        } else {
            FilterAction::Continue
        }
    }
}

/// Accounts initial SYNs against the per-IP window and the global
/// half-open cap; escalates a heavy offender into the shun list.
pub struct SynGuard;

impl PacketFilter for SynGuard {
    fn name(&self) -> &'static str {
        "syn-guard"
    }

    fn apply(&self, pkt: &PacketView, table: &StateTable) -> FilterAction {
        if !(pkt.flags.syn && !pkt.flags.ack) {
            return FilterAction::Continue;
        }
        match table.register_syn(pkt.src_ip) {
            SynGate::Banned => FilterAction::Drop("ban-on-syn-rate"),
            SynGate::Flood => FilterAction::Drop("syn-flood"),
            SynGate::Clear => FilterAction::Continue,
        }
    }
}

/// Per-source RST rate limit.
pub struct RstThrottle;

impl PacketFilter for RstThrottle {
    fn name(&self) -> &'static str {
        "rst-throttle"
    }

    fn apply(&self, pkt: &PacketView, table: &StateTable) -> FilterAction {
        if pkt.flags.rst && table.register_rst(pkt.src_ip) {
            FilterAction::Drop("rst-flood")
        } else {
            FilterAction::Continue
        }
    }
}

/// Blocks payload bytes on flows that have not finished the handshake.
///
/// The state read here and the state machine below run under separate lock
/// acquisitions; a concurrent packet may move the flow in between. The worst
/// case is a one-packet accept/drop flip at the instant of transition, which
/// the next packet corrects.
pub struct EarlyDataBlock;

impl PacketFilter for EarlyDataBlock {
    fn name(&self) -> &'static str {
        "early-data-block"
    }

    fn apply(&self, pkt: &PacketView, table: &StateTable) -> FilterAction {
        if pkt.payload_len == 0 {
            return FilterAction::Continue;
        }
        let state = table.peek_state(pkt.src_ip, pkt.dst_ip, pkt.src_port, pkt.dst_port);
        if state != Some(TcpState::Established) {
            FilterAction::Drop("early-data")
        } else {
            FilterAction::Continue
        }
    }
}

/// The terminal filter: the bidirectional TCP state machine.
pub struct StateMachine;

impl PacketFilter for StateMachine {
    fn name(&self) -> &'static str {
        "state-machine"
    }

    fn apply(&self, pkt: &PacketView, table: &StateTable) -> FilterAction {
        let d = table.decide(
            pkt.src_ip,
            pkt.dst_ip,
            pkt.src_port,
            pkt.dst_port,
            pkt.flags.syn,
            pkt.flags.ack,
            pkt.flags.fin,
            pkt.flags.rst,
        );
        if d.accept {
            FilterAction::Accept(d.reason)
        } else {
            FilterAction::Drop(d.reason)
        }
    }
}

// =============================================================================
// PIPELINE
// =============================================================================

pub struct Pipeline {
    table: Arc<StateTable>,
    stats: Arc<PipelineStats>,
    filters: Vec<Box<dyn PacketFilter>>,
}

impl Pipeline {
    /// The standard chain, in enforcement order.
    pub fn new(table: Arc<StateTable>, stats: Arc<PipelineStats>) -> Self {
        Self::with_filters(
            table,
            stats,
            vec![
                Box::new(FlagSanity),
                Box::new(ShunList),
                Box::new(SynGuard),
                Box::new(RstThrottle),
                Box::new(EarlyDataBlock),
                Box::new(StateMachine),
            ],
        )
    }

    pub fn with_filters(
        table: Arc<StateTable>,
        stats: Arc<PipelineStats>,
        filters: Vec<Box<dyn PacketFilter>>,
    ) -> Self {
        Self {
            table,
            stats,
            filters,
        }
    }

    pub fn table(&self) -> &Arc<StateTable> {
        &self.table
    }

    /// Decide the fate of one raw datagram.
    pub fn evaluate(&self, buf: &[u8]) -> Verdict {
        let verdict = self.evaluate_inner(buf);
        self.stats.record(verdict.accept, verdict.reason);
        if !verdict.accept {
            debug!("drop: {}", verdict.reason);
        }
        verdict
    }

    fn evaluate_inner(&self, buf: &[u8]) -> Verdict {
        // The firewall only adjudicates IPv4/TCP; everything else passes.
        let view = match decode(buf) {
            Decoded::Tcp(view) => view,
            Decoded::NotTcp => return Verdict::accept("non-tcp"),
            Decoded::Malformed(_) => return Verdict::accept("malformed"),
        };

        for filter in &self.filters {
            match filter.apply(&view, &self.table) {
                FilterAction::Continue => {}
                FilterAction::Accept(reason) => return Verdict::accept(reason),
                FilterAction::Drop(reason) => return Verdict::drop(reason),
            }
        }
        Verdict::accept("default")
    }
}

// =============================================================================
// TESTS
// =============================================================================
