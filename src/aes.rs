/*
 * AES block ciphers (cbc, ecb, ctr).
 *
 * Requests are queued per engine and drained by a single batch worker.
 * Each batch copies every request's source into one gather buffer and goes
 * out as one message with an entry per request, encrypting in place. The
 * dispatcher copies results back out and completes each request through
 * its callback.
 */
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock, Weak};

use common::ivc::{
    AesOpArgs, Engine, IvcHeader, IvcRxMsg, SeAddr, AES_BLOCK_SIZE, AES_IV_SEL_IV_REG,
    AES_IV_SEL_ORIGINAL, AES_IV_SIZE, AES_LCTR_CNTN, AES_MAX_KEY_SIZE, AES_MODE_CBC,
    AES_MODE_CTR, AES_MODE_ECB, CMD_AES_DECRYPT, CMD_AES_ENCRYPT, MAX_BUFFER_SIZE,
    MAX_TASKS_PER_SUBMIT,
};
use parking_lot::Mutex;
use tracing::{debug, error, warn};
use zerocopy::FromZeros;

use crate::device::SeDevice;
use crate::dma::DmaBuffer;
use crate::error::{check_status, VseError, EBUSY, EINPROGRESS};
use crate::keyslot::{self, KeyType, KeyslotState};
use crate::pending::{BatchCompletion, PendingOp};
use crate::sg::ScatterList;
use crate::sync::{InflightGate, WorkQueue};

/// Requests held by the engine queue before backlogging starts.
pub const CRYPTO_QUEUE_LEN: usize = 100;

/// Batch messages allowed in flight per engine.
pub const NUM_SERVER_REQ: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AesMode {
    Cbc,
    Ecb,
    Ctr,
}

impl AesMode {
    pub const ALL: [AesMode; 3] = [AesMode::Cbc, AesMode::Ecb, AesMode::Ctr];

    pub fn name(self) -> &'static str {
        match self {
            AesMode::Cbc => "cbc(aes)",
            AesMode::Ecb => "ecb(aes)",
            AesMode::Ctr => "ctr(aes)",
        }
    }

    fn wire(self) -> u32 {
        match self {
            AesMode::Cbc => AES_MODE_CBC,
            AesMode::Ecb => AES_MODE_ECB,
            AesMode::Ctr => AES_MODE_CTR,
        }
    }
}

pub type CipherCallback = Arc<dyn Fn(CipherEvent) + Send + Sync>;

pub struct CipherRequest {
    pub src: ScatterList,
    pub dst: ScatterList,
    pub iv: Option<[u8; AES_IV_SIZE]>,
    /// Accept into the backlog when the queue is full.
    pub may_backlog: bool,
    pub callback: CipherCallback,
}

impl CipherRequest {
    pub fn new(src: ScatterList, iv: Option<[u8; AES_IV_SIZE]>, callback: CipherCallback) -> Self {
        let dst = ScatterList::zeroed_like(&src);
        Self {
            src,
            dst,
            iv,
            may_backlog: false,
            callback,
        }
    }

    pub fn with_backlog(mut self) -> Self {
        self.may_backlog = true;
        self
    }
}

/// A finished request handed back to its owner.
pub struct CipherDone {
    pub src: ScatterList,
    pub dst: ScatterList,
    /// For CBC encryption, the engine's output IV for chaining.
    pub iv: Option<[u8; AES_IV_SIZE]>,
    pub result: Result<(), VseError>,
}

impl CipherDone {
    pub fn errno(&self) -> i32 {
        match &self.result {
            Ok(()) => 0,
            Err(err) => err.errno(),
        }
    }
}

pub enum CipherEvent {
    /// A backlogged request has moved into the queue.
    InProgress,
    Done(CipherDone),
}

/// How an accepted request entered the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enqueued {
    InProgress,
    Backlogged,
}

impl Enqueued {
    pub fn errno(self) -> i32 {
        match self {
            Enqueued::InProgress => -EINPROGRESS,
            Enqueued::Backlogged => -EBUSY,
        }
    }
}

struct QueuedRequest {
    req: CipherRequest,
    encrypt: bool,
    mode: AesMode,
    engine: Engine,
    key: Arc<Mutex<KeyslotState>>,
}

impl QueuedRequest {
    fn finish(self, result: Result<(), VseError>) {
        let QueuedRequest { req, .. } = self;
        let callback = req.callback;
        callback(CipherEvent::Done(CipherDone {
            src: req.src,
            dst: req.dst,
            iv: req.iv,
            result,
        }));
    }
}

/// Bounded FIFO. Entries past `max_qlen` are the backlog.
struct CryptoQueue<T> {
    fifo: VecDeque<T>,
    max_qlen: usize,
    busy: bool,
}

impl<T> CryptoQueue<T> {
    fn new(max_qlen: usize) -> Self {
        Self {
            fifo: VecDeque::new(),
            max_qlen,
            busy: false,
        }
    }

    fn enqueue(&mut self, item: T, may_backlog: bool) -> Result<Enqueued, VseError> {
        let status = if self.fifo.len() >= self.max_qlen {
            if !may_backlog {
                return Err(VseError::QueueFull);
            }
            Enqueued::Backlogged
        } else {
            Enqueued::InProgress
        };
        self.fifo.push_back(item);
        Ok(status)
    }

    /// Pops the head. Also returns the backlogged entry that this moves into
    /// the queue proper, if any.
    fn dequeue(&mut self) -> Option<(T, Option<&T>)> {
        let head = self.fifo.pop_front()?;
        // the entry that was at index max_qlen is now inside the queue
        let promoted = match self.fifo.len() >= self.max_qlen {
            true => self.fifo.get(self.max_qlen - 1),
            false => None,
        };
        Some((head, promoted))
    }

    fn front(&self) -> Option<&T> {
        self.fifo.front()
    }

    fn len(&self) -> usize {
        self.fifo.len()
    }

    fn is_empty(&self) -> bool {
        self.fifo.is_empty()
    }
}

/// Queue, worker and in-flight accounting of the engine that runs ciphers.
pub(crate) struct AesEngine {
    queue: spin::Mutex<CryptoQueue<QueuedRequest>>,
    inflight: Arc<InflightGate>,
    worker: OnceLock<WorkQueue>,
}

impl AesEngine {
    pub fn new() -> Self {
        Self {
            queue: spin::Mutex::new(CryptoQueue::new(CRYPTO_QUEUE_LEN)),
            inflight: Arc::new(InflightGate::new(NUM_SERVER_REQ)),
            worker: OnceLock::new(),
        }
    }

    pub fn start_worker(&self, dev: Weak<SeDevice>) -> std::io::Result<()> {
        let wq = WorkQueue::new("vse-aes-batch", move || {
            if let Some(dev) = dev.upgrade() {
                work_handler(&dev);
            }
        })?;
        let _ = self.worker.set(wq);
        Ok(())
    }

    fn kick(&self) {
        if let Some(wq) = self.worker.get() {
            wq.queue();
        }
    }

    /// Blocks until no batch is being built or submitted.
    pub fn flush(&self) {
        if let Some(wq) = self.worker.get() {
            wq.flush();
        }
    }

    pub fn wait_idle(&self) {
        self.inflight.wait_idle();
    }

    pub fn inflight(&self) -> usize {
        self.inflight.outstanding()
    }

    /// Restarts draining after a resume.
    pub fn restart(&self) {
        let idle = {
            let mut q = self.queue.lock();
            let idle = !q.busy && !q.is_empty();
            if idle {
                q.busy = true;
            }
            idle
        };
        if idle {
            self.kick();
        }
    }

    /// Completes everything still queued with `err`.
    pub fn fail_queued(&self, err: VseError) {
        let drained: Vec<QueuedRequest> = {
            let mut q = self.queue.lock();
            q.busy = false;
            q.fifo.drain(..).collect()
        };
        for req in drained {
            req.finish(Err(err));
        }
    }

    pub fn stop(&self) {
        if let Some(wq) = self.worker.get() {
            wq.stop();
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }
}

pub struct AesSession {
    dev: Arc<SeDevice>,
    mode: AesMode,
    key: Arc<Mutex<KeyslotState>>,
}

impl AesSession {
    pub(crate) fn new(dev: Arc<SeDevice>, mode: AesMode) -> Self {
        Self {
            dev,
            mode,
            key: Arc::new(Mutex::new(KeyslotState::default())),
        }
    }

    pub fn mode(&self) -> AesMode {
        self.mode
    }

    /// The slot the session's key lives in, once set.
    pub fn keyslot(&self) -> Option<u32> {
        let key = self.key.lock();
        key.allocated.then_some(key.slot)
    }

    pub fn set_key(&self, key: &[u8]) -> Result<(), VseError> {
        let dev = &self.dev;
        dev.check_running()?;
        let mut state = self.key.lock();

        if !dev.disable_keyslot_label {
            if let Some(label) = keyslot::parse_keyslot_label(key) {
                let slot = label?;
                crate::ensure!(key.len() <= AES_MAX_KEY_SIZE)?;
                keyslot::release_owned(dev, &mut state);
                state.keylen = key.len() as u32;
                state.slot = slot;
                state.allocated = true;
                state.is_label = true;
                debug!(slot, "cipher key bound to labelled slot");
                return keyslot::set_keyiv(dev, key, state.keylen, slot, KeyType::KEY);
            }
        }

        keyslot::check_key_len(key)?;
        if !state.allocated {
            state.slot = keyslot::alloc_keyslot(dev)?;
            state.allocated = true;
            state.is_label = false;
        }
        state.keylen = key.len() as u32;
        keyslot::set_keyiv(dev, key, state.keylen, state.slot, KeyType::KEY)
    }

    pub fn encrypt(&self, req: CipherRequest) -> Result<Enqueued, VseError> {
        self.queue_request(req, true)
    }

    pub fn decrypt(&self, req: CipherRequest) -> Result<Enqueued, VseError> {
        self.queue_request(req, false)
    }

    fn queue_request(&self, req: CipherRequest, encrypt: bool) -> Result<Enqueued, VseError> {
        let dev = &self.dev;
        dev.check_running()?;
        let aes = dev.aes.as_ref().ok_or(VseError::NoDevice)?;

        let nbytes = req.src.len();
        crate::ensure!(nbytes % AES_BLOCK_SIZE == 0)?;
        crate::ensure!(nbytes <= MAX_BUFFER_SIZE)?;
        crate::ensure!(req.src.count_for(nbytes) > 0)?;
        crate::ensure!(req.dst.len() >= nbytes)?;
        crate::ensure!(self.key.lock().allocated, VseError::KeyNotSet)?;

        let may_backlog = req.may_backlog;
        let queued = QueuedRequest {
            req,
            encrypt,
            mode: self.mode,
            engine: dev.engine,
            key: self.key.clone(),
        };

        let (status, idle) = {
            let mut q = aes.queue.lock();
            let status = q.enqueue(queued, may_backlog);
            let idle = !q.busy;
            if idle {
                q.busy = true;
            }
            (status, idle)
        };
        if idle {
            aes.kick();
        }
        if let Err(err) = &status {
            warn!(engine = dev.engine.id(), %err, "cipher request refused");
        }
        status
    }
}

impl Drop for AesSession {
    fn drop(&mut self) {
        let mut state = self.key.lock();
        keyslot::release_owned(&self.dev, &mut state);
    }
}

fn work_handler(dev: &SeDevice) {
    let Some(aes) = dev.aes.as_ref() else {
        return;
    };
    let _mtx = dev.mtx.lock();
    loop {
        let mut batch = Vec::new();
        let mut promoted = Vec::new();
        let mut gather_sz = 0usize;
        let busy = {
            let mut q = aes.queue.lock();
            if dev.is_suspended() {
                // left queued; resume restarts the worker
                q.busy = false;
                return;
            }
            while batch.len() < MAX_TASKS_PER_SUBMIT {
                // the gather buffer of one message stays within MAX_BUFFER_SIZE
                let next = q.front().map_or(0, |r| r.req.src.len());
                if !batch.is_empty() && gather_sz + next > MAX_BUFFER_SIZE {
                    break;
                }
                match q.dequeue() {
                    Some((req, backlog)) => {
                        if let Some(b) = backlog {
                            promoted.push(b.req.callback.clone());
                        }
                        gather_sz += req.req.src.len();
                        batch.push(req);
                    }
                    None => {
                        q.busy = false;
                        break;
                    }
                }
                if q.is_empty() {
                    break;
                }
            }
            q.busy
        };

        for callback in promoted {
            callback(CipherEvent::InProgress);
        }
        if !batch.is_empty() {
            process_batch(dev, aes, batch);
        }
        if !busy {
            break;
        }
    }
}

fn fail_all(batch: Vec<QueuedRequest>, err: VseError) {
    for req in batch {
        req.finish(Err(err));
    }
}

/// Builds and sends one message for `batch`.
fn process_batch(dev: &SeDevice, aes: &AesEngine, batch: Vec<QueuedRequest>) {
    let gather_sz: usize = batch.iter().map(|r| r.req.src.len()).sum();

    let gather = match dev.core.dma.alloc_coherent(gather_sz) {
        Ok(buf) => buf,
        Err(err) => {
            error!(engine = dev.engine.id(), gather_sz, "gather buffer allocation failed");
            return fail_all(batch, err);
        }
    };
    let mut msg = match dev.core.msgs.checkout() {
        Ok(msg) => msg,
        Err(err) => return fail_all(batch, err),
    };

    let mut engine: Option<Engine> = None;
    let mut failure = None;
    let mut offset = 0usize;
    for (k, r) in batch.iter().enumerate() {
        let nbytes = r.req.src.len();
        gather.with_mut(|buf| r.req.src.copy_to_buffer(0, &mut buf[offset..offset + nbytes]));

        let key = *r.key.lock();
        if !key.allocated {
            error!(engine = dev.engine.id(), "AES keyslot not allocated");
            failure = Some(VseError::KeyNotSet);
            break;
        }
        match engine {
            None => engine = Some(r.engine),
            Some(first) if first != r.engine => {
                error!(
                    first = first.id(),
                    other = r.engine.id(),
                    "engine id differs within a batch"
                );
                failure = Some(VseError::EngineMismatch {
                    first: first.id(),
                    other: r.engine.id(),
                });
                break;
            }
            Some(_) => {}
        }

        let mut args = AesOpArgs::new_zeroed();
        args.keyslot.set(key.slot);
        args.key_length.set(key.keylen);
        args.mode.set(r.mode.wire());
        args.ivsel.set(AES_IV_SEL_ORIGINAL);
        if let Some(iv) = r.req.iv {
            args.lctr = iv;
            match r.mode {
                AesMode::Ctr => args.ctr_cntn.set(AES_LCTR_CNTN),
                AesMode::Cbc => args.ivsel.set(AES_IV_SEL_IV_REG),
                AesMode::Ecb => {}
            }
        }
        let addr = gather.addr() + offset as u32;
        args.src = SeAddr::new(addr, nbytes as u32);
        args.dst = SeAddr::new(addr, nbytes as u32);

        let entry = &mut msg.tx[k];
        entry.cmd.set(if r.encrypt {
            CMD_AES_ENCRYPT
        } else {
            CMD_AES_DECRYPT
        });
        entry.set_aes_op(args);
        offset += nbytes;
    }

    if let Some(err) = failure {
        return fail_all(batch, err);
    }
    let engine = engine.unwrap_or(dev.engine);
    let count = batch.len();
    msg.hdr = IvcHeader::new(engine, count as u32);

    let op = PendingOp::with_batch(Box::new(AesBatch {
        reqs: batch,
        gather,
        inflight: aes.inflight.clone(),
    }));

    aes.inflight.acquire();
    debug!(engine = engine.id(), count, gather_sz, "submitting cipher batch");
    if let Err((err, op)) = dev.submit_async(&mut msg, op) {
        if let Some(batch) = op.take_batch() {
            batch.fail(err);
        }
    }
}

struct AesBatch {
    reqs: Vec<QueuedRequest>,
    gather: DmaBuffer,
    inflight: Arc<InflightGate>,
}

impl BatchCompletion for AesBatch {
    fn complete(self: Box<Self>, rsp: &IvcRxMsg) {
        let AesBatch {
            reqs,
            gather,
            inflight,
        } = *self;
        let mut offset = 0usize;
        for (k, mut r) in reqs.into_iter().enumerate() {
            let nbytes = r.req.src.len();
            gather.with(|buf| r.req.dst.copy_from_buffer(0, &buf[offset..offset + nbytes]));
            offset += nbytes;

            let entry = &rsp.rx[k];
            if r.mode == AesMode::Cbc && r.encrypt {
                r.req.iv = Some(entry.result);
            }
            let result = check_status(entry.status.get());
            if let Err(err) = &result {
                debug!(k, %err, "cipher request failed in the engine");
            }
            r.finish(result);
        }
        drop(gather);
        inflight.release();
    }

    fn fail(self: Box<Self>, err: VseError) {
        let AesBatch {
            reqs,
            gather,
            inflight,
        } = *self;
        drop(gather);
        inflight.release();
        fail_all(reqs, err);
    }
}
