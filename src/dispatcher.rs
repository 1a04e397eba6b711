/*
 * Completion dispatcher.
 *
 * A single thread owns the receive side of the channel. It sleeps until the
 * channel interrupt fires, drains every readable response and hands each to
 * the pending record named by its tag. Nothing here may panic or stop on a
 * bad response: every completion in the driver flows through this thread.
 */
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use common::ivc::{IvcRxMsg, IVC_MSG_SIZE, MAX_TASKS_PER_SUBMIT};
use tracing::{debug, error, warn};
use zerocopy::FromBytes;

use crate::debug::trace_rx;
use crate::device::Core;
use crate::pending::{Handle, OpKind, PendingTable};
use crate::sync::Completion;

const IDLE_WAKEUP: Duration = Duration::from_millis(500);

pub(crate) struct Dispatcher {
    stop: Arc<AtomicBool>,
    irq: Arc<Completion>,
    thread: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn start(core: Arc<Core>) -> std::io::Result<Self> {
        let irq = Arc::new(Completion::new());
        let stop = Arc::new(AtomicBool::new(false));

        let signal = irq.clone();
        core.transport
            .channel()
            .set_irq_handler(Box::new(move || signal.complete()));

        let wake = irq.clone();
        let halt = stop.clone();
        let thread = std::thread::Builder::new()
            .name("vse-dispatch".into())
            .spawn(move || {
                let mut frame = vec![0u8; IVC_MSG_SIZE];
                while !halt.load(Ordering::Acquire) {
                    // the periodic wakeup covers an interrupt raised before
                    // the handler was installed
                    wake.wait_timeout(IDLE_WAKEUP);
                    if halt.load(Ordering::Acquire) {
                        break;
                    }
                    if let Err(err) = core
                        .transport
                        .poll_and_receive(&mut frame, |f| dispatch(&core.pending, f))
                    {
                        error!(%err, "response poll failed");
                    }
                }
                debug!("dispatcher stopped");
            })?;

        Ok(Self {
            stop,
            irq,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.irq.complete();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("dispatcher thread panicked");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Routes one response frame to its pending record.
pub(crate) fn dispatch(pending: &PendingTable, frame: &[u8]) {
    let Ok(rsp) = IvcRxMsg::ref_from_bytes(frame) else {
        error!(len = frame.len(), "response frame has the wrong size");
        return;
    };
    trace_rx(rsp);

    let num_reqs = rsp.hdr.num_reqs.get() as usize;
    if num_reqs == 0 || num_reqs > MAX_TASKS_PER_SUBMIT {
        error!(num_reqs, "response with invalid request count");
        return;
    }

    let handle = Handle::from_tag(&rsp.hdr.tag);
    let Some(op) = pending.take(handle) else {
        warn!(
            index = handle.index,
            generation = handle.generation,
            "response for unknown or stale request"
        );
        return;
    };

    let first = &rsp.rx[0];
    match op.kind {
        OpKind::AesCrypto => match op.take_batch() {
            Some(batch) => batch.complete(rsp),
            None => error!("crypto response without a batch"),
        },
        OpKind::KeySlot => {
            {
                let mut result = op.result.lock();
                result.status = first.status.get();
                result.keyslot = first.result[0];
            }
            op.done.complete();
        }
        OpKind::Process => {
            op.result.lock().status = first.status.get();
            op.done.complete();
        }
        OpKind::CmacProcess => {
            {
                let mut result = op.result.lock();
                result.status = first.status.get();
                result.cmac = first.result;
            }
            op.done.complete();
        }
    }
}
