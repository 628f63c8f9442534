//! NFQUEUE transport adapter.
//!
//! Receives datagrams redirected by the kernel, runs the decision pipeline,
//! and emits the verdict keyed by packet id. The core stays pure
//! bytes-in/verdict-out; everything netlink lives here.

use crate::config::QueueConfig;
use crate::pipeline::Pipeline;
use anyhow::{Context, Result};
use nfq::{Queue, Verdict as NfVerdict};
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct QueueRunner {
    cfg: QueueConfig,
    pipeline: Arc<Pipeline>,
}

impl QueueRunner {
    pub fn new(cfg: QueueConfig, pipeline: Arc<Pipeline>) -> Self {
        Self { cfg, pipeline }
    }

    /// Bind the queue and process packets indefinitely.
    ///
    /// Blocking; run on a dedicated thread. Setup failures return an error;
    /// once bound, recv and verdict failures are logged and always retried,
    /// so the loop never exits on its own. The fate of a packet whose
    /// verdict could not be emitted is left to the kernel.
    pub fn run(&self) -> Result<()> {
        let mut queue = Queue::open().context("could not open nfqueue socket")?;
        queue
            .bind(self.cfg.queue_num)
            .with_context(|| format!("could not bind nfqueue {}", self.cfg.queue_num))?;
        queue
            .set_queue_max_len(self.cfg.queue_num, self.cfg.max_queue_len)
            .context("could not set queue length")?;
        // Full packet copy up to the configured range.
        queue
            .set_copy_range(self.cfg.queue_num, self.cfg.max_packet_len)
            .context("could not set copy range")?;
        // Avoid receiving ENOBUFS errors when the socket buffer overflows.
        queue
            .set_recv_enobufs(false)
            .context("could not disable ENOBUFS delivery")?;

        info!(
            "nfqueue: bound queue {} (copy range {}, queue len {})",
            self.cfg.queue_num, self.cfg.max_packet_len, self.cfg.max_queue_len
        );

        loop {
            let mut msg = match queue.recv() {
                Ok(msg) => msg,
                Err(e) => {
                    error!("nfqueue recv failed: {}", e);
                    continue;
                }
            };

            let verdict = self.pipeline.evaluate(msg.get_payload());
            msg.set_verdict(if verdict.accept {
                NfVerdict::Accept
            } else {
                NfVerdict::Drop
            });

            if let Err(e) = queue.verdict(msg) {
                warn!("failed to emit verdict: {}", e);
            }
        }
    }
}
