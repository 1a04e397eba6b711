/*
 * Per-engine device state and the submission paths shared by every
 * algorithm: the synchronous submit-and-wait used for single-shot commands
 * and the fire-and-forget send used by cipher batches.
 */
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::ivc::{Engine, IvcHeader, IvcTxMsg};
use parking_lot::Mutex;
use tracing::{error, warn};
use zerocopy::IntoBytes;

use crate::aes::AesEngine;
use crate::config::{ProbeConfig, Timeouts};
use crate::debug::trace_tx;
use crate::dma::DmaSpace;
use crate::error::VseError;
use crate::ivc::IvcTransport;
use crate::pending::{MsgPool, OpKind, OpResult, PendingOp, PendingTable, PooledMsg};

/// State shared by every engine: the channel, the pending table and the DMA
/// space. Created by the first probe.
pub(crate) struct Core {
    pub transport: IvcTransport,
    pub pending: PendingTable,
    pub msgs: MsgPool,
    pub dma: Arc<DmaSpace>,
    pub timeouts: Timeouts,
    pub sha_buffer_size: usize,
}

pub(crate) struct SeDevice {
    pub engine: Engine,
    pub core: Arc<Core>,
    pub disable_keyslot_label: bool,
    suspended: AtomicBool,
    /// Held across a single-shot submit and its wait.
    pub server_lock: Mutex<()>,
    /// Serializes streaming hash/CMAC steps and cipher batch building.
    pub mtx: Mutex<()>,
    pub aes: Option<AesEngine>,
}

impl SeDevice {
    pub fn new(cfg: &ProbeConfig, core: Arc<Core>) -> std::io::Result<Arc<Self>> {
        let dev = Arc::new(Self {
            engine: cfg.engine,
            core,
            disable_keyslot_label: cfg.disable_keyslot_label,
            suspended: AtomicBool::new(false),
            server_lock: Mutex::new(()),
            mtx: Mutex::new(()),
            aes: (cfg.engine == Engine::Aes1).then(AesEngine::new),
        });
        if let Some(aes) = &dev.aes {
            aes.start_worker(Arc::downgrade(&dev))?;
        }
        Ok(dev)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Release);
    }

    pub fn check_running(&self) -> Result<(), VseError> {
        crate::ensure_not!(self.is_suspended(), VseError::Suspended)
    }

    /// A zeroed single-request message addressed to this engine.
    pub fn request(&self, cmd: u32) -> Result<PooledMsg<'_>, VseError> {
        let mut msg = self.core.msgs.checkout()?;
        msg.hdr = IvcHeader::new(self.engine, 1);
        msg.tx[0].cmd.set(cmd);
        Ok(msg)
    }

    /// Sends `msg` and blocks until its response arrives or the completion
    /// timeout passes. The engine's status word is returned unchecked.
    pub fn submit_sync(&self, msg: &mut IvcTxMsg, kind: OpKind) -> Result<OpResult, VseError> {
        self.check_running()?;
        let op = PendingOp::new(kind);
        let handle = self.core.pending.insert(op.clone())?;
        msg.hdr.tag = handle.to_tag();

        let _server = self.server_lock.lock();
        if self.is_suspended() {
            self.core.pending.take(handle);
            return Err(VseError::Suspended);
        }

        trace_tx(msg);
        if let Err(err) = self.core.transport.send(msg.as_bytes()) {
            error!(engine = self.engine.id(), %err, "send failed");
            self.core.pending.take(handle);
            return Err(err);
        }

        let timeout = self.core.timeouts.completion;
        if !op.done.wait_timeout(timeout) {
            if self.core.pending.take(handle).is_some() {
                error!(
                    engine = self.engine.id(),
                    cmd = msg.tx[0].cmd.get(),
                    "timed out waiting for response"
                );
                return Err(VseError::TimedOut);
            }
            // the dispatcher claimed the record just as the wait expired
            if !op.done.wait_timeout(timeout) {
                warn!(engine = self.engine.id(), "claimed response never signalled");
                return Err(VseError::TimedOut);
            }
        }
        let result = *op.result.lock();
        Ok(result)
    }

    /// Sends a batch message whose completion runs on the dispatcher.
    /// On failure the record is withdrawn and handed back to the caller.
    pub fn submit_async(
        &self,
        msg: &mut IvcTxMsg,
        op: Arc<PendingOp>,
    ) -> Result<(), (VseError, Arc<PendingOp>)> {
        let handle = match self.core.pending.insert(op.clone()) {
            Ok(handle) => handle,
            Err(err) => return Err((err, op)),
        };
        msg.hdr.tag = handle.to_tag();
        trace_tx(msg);
        if let Err(err) = self.core.transport.send(msg.as_bytes()) {
            error!(engine = self.engine.id(), %err, "batch send failed");
            let op = self.core.pending.take(handle).unwrap_or(op);
            return Err((err, op));
        }
        Ok(())
    }
}
