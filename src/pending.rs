/*
 * Pending-operation records and the table that correlates them with
 * responses.
 *
 * The wire tag carries only a small handle: a table index plus the
 * generation of the slot when the record was inserted. A response whose
 * generation no longer matches (the slot was freed and reused) is rejected.
 */
use std::sync::Arc;

use common::ivc::{IvcRxMsg, IvcTxMsg, CMAC_DIGEST_SIZE};
use tracing::error;
use zerocopy::FromZeros;

use crate::error::VseError;
use crate::sync::Completion;

/// Table capacity.
pub const PENDING_SLOTS: usize = 64;

/// Spare request frames kept for reuse.
pub const MSG_POOL_SIZE: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    /// A batch of block-cipher requests.
    AesCrypto,
    /// Keyslot allocation; the response carries the slot.
    KeySlot,
    /// Any other single-shot command.
    Process,
    /// CMAC; the response carries the MAC.
    CmacProcess,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpResult {
    pub status: u32,
    pub keyslot: u8,
    pub cmac: [u8; CMAC_DIGEST_SIZE],
}

/// Completion logic for a batch, run on the dispatcher thread.
pub trait BatchCompletion: Send {
    fn complete(self: Box<Self>, rsp: &IvcRxMsg);

    /// The batch never reached the engine.
    fn fail(self: Box<Self>, err: VseError);
}

pub struct PendingOp {
    pub kind: OpKind,
    pub done: Completion,
    pub result: spin::Mutex<OpResult>,
    batch: spin::Mutex<Option<Box<dyn BatchCompletion>>>,
}

impl PendingOp {
    pub fn new(kind: OpKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            done: Completion::new(),
            result: spin::Mutex::new(OpResult::default()),
            batch: spin::Mutex::new(None),
        })
    }

    pub fn with_batch(batch: Box<dyn BatchCompletion>) -> Arc<Self> {
        let op = Self::new(OpKind::AesCrypto);
        *op.batch.lock() = Some(batch);
        op
    }

    pub fn take_batch(&self) -> Option<Box<dyn BatchCompletion>> {
        self.batch.lock().take()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handle {
    pub index: u32,
    pub generation: u32,
}

impl Handle {
    pub fn to_tag(self) -> [u8; 16] {
        let mut tag = [0u8; 16];
        tag[..4].copy_from_slice(&self.index.to_le_bytes());
        tag[4..8].copy_from_slice(&self.generation.to_le_bytes());
        tag
    }

    pub fn from_tag(tag: &[u8; 16]) -> Self {
        let mut index = [0u8; 4];
        let mut generation = [0u8; 4];
        index.copy_from_slice(&tag[..4]);
        generation.copy_from_slice(&tag[4..8]);
        Self {
            index: u32::from_le_bytes(index),
            generation: u32::from_le_bytes(generation),
        }
    }
}

struct Slot {
    generation: u32,
    op: Option<Arc<PendingOp>>,
}

struct Slots {
    entries: heapless::Vec<Slot, PENDING_SLOTS>,
    free: heapless::Vec<u32, PENDING_SLOTS>,
}

pub struct PendingTable {
    slots: spin::Mutex<Slots>,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            slots: spin::Mutex::new(Slots {
                entries: heapless::Vec::new(),
                free: heapless::Vec::new(),
            }),
        }
    }

    pub fn insert(&self, op: Arc<PendingOp>) -> Result<Handle, VseError> {
        let mut slots = self.slots.lock();
        if let Some(index) = slots.free.pop() {
            let slot = &mut slots.entries[index as usize];
            slot.op = Some(op);
            return Ok(Handle {
                index,
                generation: slot.generation,
            });
        }
        let index = slots.entries.len() as u32;
        match slots.entries.push(Slot {
            generation: 0,
            op: Some(op),
        }) {
            Ok(()) => Ok(Handle {
                index,
                generation: 0,
            }),
            Err(_) => {
                error!("pending-operation table full");
                Err(VseError::NoPendingSlot)
            }
        }
    }

    /// Removes the record `handle` names. `None` for unknown or stale handles.
    pub fn take(&self, handle: Handle) -> Option<Arc<PendingOp>> {
        let mut slots = self.slots.lock();
        let slot = slots.entries.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let op = slot.op.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        // cannot overflow: every index in `free` came out of `entries`
        let _ = slots.free.push(handle.index);
        Some(op)
    }

    pub fn outstanding(&self) -> usize {
        self.slots
            .lock()
            .entries
            .iter()
            .filter(|s| s.op.is_some())
            .count()
    }
}

/// Reusable request frames.
pub struct MsgPool {
    free: spin::Mutex<heapless::Vec<Box<IvcTxMsg>, MSG_POOL_SIZE>>,
}

impl Default for MsgPool {
    fn default() -> Self {
        Self::new()
    }
}

impl MsgPool {
    pub fn new() -> Self {
        Self {
            free: spin::Mutex::new(heapless::Vec::new()),
        }
    }

    /// A zeroed frame, from the pool when one is spare.
    pub fn checkout(&self) -> Result<PooledMsg<'_>, VseError> {
        let spare = self.free.lock().pop();
        let msg = match spare {
            Some(mut msg) => {
                msg.zero();
                msg
            }
            None => IvcTxMsg::new_box_zeroed().map_err(|_| VseError::NoMemory)?,
        };
        Ok(PooledMsg {
            pool: self,
            msg: Some(msg),
        })
    }

    pub fn spare(&self) -> usize {
        self.free.lock().len()
    }
}

pub struct PooledMsg<'a> {
    pool: &'a MsgPool,
    msg: Option<Box<IvcTxMsg>>,
}

impl core::ops::Deref for PooledMsg<'_> {
    type Target = IvcTxMsg;

    fn deref(&self) -> &IvcTxMsg {
        // populated until drop
        self.msg.as_deref().unwrap_or_else(|| unreachable!())
    }
}

impl core::ops::DerefMut for PooledMsg<'_> {
    fn deref_mut(&mut self) -> &mut IvcTxMsg {
        self.msg.as_deref_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledMsg<'_> {
    fn drop(&mut self) {
        if let Some(msg) = self.msg.take() {
            // a full pool just frees the frame
            let _ = self.pool.free.lock().push(msg);
        }
    }
}
