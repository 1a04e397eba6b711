/*
 * AES-CMAC on the AES0 engine.
 *
 * Every update or finup is a single engine call. The engine keeps no state
 * between calls: the intermediate MAC travels in the request's result
 * buffer and comes back as the chaining register of the next call.
 */
use std::sync::Arc;

use common::ivc::{
    CmacArgs, CmacSubkeyArgs, AES_BLOCK_SIZE, AES_IV_SEL_IV_REG, AES_IV_SEL_ORIGINAL,
    AES_MAX_KEY_SIZE, CMAC_CONFIG_LASTBLK, CMAC_CONFIG_NONLASTBLK, CMAC_DIGEST_SIZE,
    CMD_AES_CMAC, CMD_AES_CMAC_GEN_SUBKEY,
};
use parking_lot::Mutex;
use tracing::{debug, error};
use zerocopy::little_endian::U64;
use zerocopy::FromZeros;

use crate::device::SeDevice;
use crate::dma::DmaBuffer;
use crate::error::{check_status, VseError};
use crate::keyslot::{self, KeyType, KeyslotState};
use crate::pending::OpKind;
use crate::sg::{prepare_linked_list, ScatterList};

/// Descriptors allowed per CMAC command.
pub const CMAC_MAX_LL_NUM: usize = 1;

/// Splits a call's input into whole blocks for the descriptor and the
/// bytes carried in the last-block field, as (blocks, lastblock_len).
///
/// A final call always carries a last block. When its input is a nonzero
/// multiple of the block size, the last whole block moves into that field.
pub(crate) fn split_last_block(nbytes: usize, is_last: bool) -> (usize, usize) {
    let blocks = nbytes / AES_BLOCK_SIZE;
    if !is_last {
        return (blocks, 0);
    }
    match nbytes % AES_BLOCK_SIZE {
        0 if blocks > 0 => (blocks - 1, AES_BLOCK_SIZE),
        rem => (blocks, rem),
    }
}

pub struct CmacSession {
    dev: Arc<SeDevice>,
    key: Arc<Mutex<KeyslotState>>,
}

impl CmacSession {
    pub(crate) fn new(dev: Arc<SeDevice>) -> Self {
        Self {
            dev,
            key: Arc::new(Mutex::new(KeyslotState::default())),
        }
    }

    pub fn keyslot(&self) -> Option<u32> {
        let key = self.key.lock();
        key.allocated.then_some(key.slot)
    }

    /// Installs `key` and derives its subkeys in the engine.
    pub fn set_key(&self, key: &[u8]) -> Result<(), VseError> {
        let dev = &self.dev;
        dev.check_running()?;
        let mut state = self.key.lock();

        let mut labelled = false;
        if !dev.disable_keyslot_label {
            if let Some(label) = keyslot::parse_keyslot_label(key) {
                let slot = label?;
                crate::ensure!(key.len() <= AES_MAX_KEY_SIZE)?;
                keyslot::release_owned(dev, &mut state);
                state.slot = slot;
                state.allocated = true;
                state.is_label = true;
                labelled = true;
                debug!(slot, "cmac key bound to labelled slot");
            }
        }
        if !labelled {
            keyslot::check_key_len(key)?;
        }

        if !state.allocated {
            state.slot = keyslot::alloc_keyslot(dev)?;
            state.allocated = true;
            state.is_label = false;
        }
        state.keylen = key.len() as u32;
        keyslot::set_keyiv(dev, key, state.keylen, state.slot, KeyType::KEY)?;
        gen_subkey(dev, &state)
    }

    pub fn request(&self) -> CmacRequest {
        CmacRequest {
            dev: self.dev.clone(),
            key: self.key.clone(),
            ctx: None,
        }
    }
}

impl Drop for CmacSession {
    fn drop(&mut self) {
        let mut state = self.key.lock();
        keyslot::release_owned(&self.dev, &mut state);
    }
}

fn gen_subkey(dev: &SeDevice, key: &KeyslotState) -> Result<(), VseError> {
    // zero block the engine encrypts to derive K1 and K2
    let _zero = dev.core.dma.alloc_coherent(AES_BLOCK_SIZE).inspect_err(|_| {
        error!("cannot allocate the subkey buffer");
    })?;

    let mut args = CmacSubkeyArgs::new_zeroed();
    args.keyslot.set(key.slot);
    args.key_length.set(key.keylen);

    let mut msg = dev.request(CMD_AES_CMAC_GEN_SUBKEY)?;
    msg.tx[0].set_cmac_subkey(args);
    let result = dev.submit_sync(&mut msg, OpKind::Process)?;
    check_status(result.status).inspect_err(|err| {
        error!(slot = key.slot, %err, "cmac subkey generation failed");
    })
}

struct CmacContext {
    hash_result: DmaBuffer,
    is_first: bool,
}

pub struct CmacRequest {
    dev: Arc<SeDevice>,
    key: Arc<Mutex<KeyslotState>>,
    ctx: Option<CmacContext>,
}

impl CmacRequest {
    pub fn is_initialized(&self) -> bool {
        self.ctx.is_some()
    }

    pub fn init(&mut self) -> Result<(), VseError> {
        self.dev.check_running()?;
        let hash_result = self
            .dev
            .core
            .dma
            .alloc_coherent(CMAC_DIGEST_SIZE)
            .inspect_err(|_| error!("cannot allocate the cmac result buffer"))?;
        self.ctx = Some(CmacContext {
            hash_result,
            is_first: true,
        });
        Ok(())
    }

    /// Feeds whole blocks. Unaligned data can only come with `finup`.
    pub fn update(&mut self, src: &ScatterList) -> Result<(), VseError> {
        crate::ensure!(src.len() % AES_BLOCK_SIZE == 0)
            .inspect_err(|_| error!(len = src.len(), "cmac update is not block aligned"))?;
        self.step(src, false).map(|_| ())
    }

    /// Does not compute anything; the MAC comes out of `finup`.
    pub fn finalize(&mut self) -> Result<(), VseError> {
        self.dev.check_running()
    }

    /// Processes the last chunk and returns the MAC. The request must be
    /// re-initialized afterwards, whatever the outcome.
    pub fn finup(&mut self, src: &ScatterList) -> Result<[u8; CMAC_DIGEST_SIZE], VseError> {
        let out = self.step(src, true);
        self.ctx = None;
        out?.ok_or(VseError::InvalidArgument)
    }

    /// `init` followed by `finalize`. Never issues the CMAC computation.
    pub fn digest(&mut self) -> Result<(), VseError> {
        self.dev.check_running()?;
        self.init()?;
        self.finalize()
    }

    fn step(
        &mut self,
        src: &ScatterList,
        is_last: bool,
    ) -> Result<Option<[u8; CMAC_DIGEST_SIZE]>, VseError> {
        let dev = self.dev.clone();
        dev.check_running()?;
        let ctx = self.ctx.as_mut().ok_or_else(|| {
            error!(is_last, "cmac request not initialized");
            VseError::NotInitialized
        })?;
        let key = *self.key.lock();
        crate::ensure!(key.allocated, VseError::KeyNotSet)?;

        let _mtx = dev.mtx.lock();
        let out = ctx.op(&dev, &key, src, is_last);
        if let Err(err) = &out {
            error!(is_last, %err, "cmac step failed");
        }
        out
    }
}

impl CmacContext {
    fn op(
        &mut self,
        dev: &SeDevice,
        key: &KeyslotState,
        src: &ScatterList,
        is_last: bool,
    ) -> Result<Option<[u8; CMAC_DIGEST_SIZE]>, VseError> {
        let nbytes = src.len();
        let (blocks, lastblock_len) = split_last_block(nbytes, is_last);

        let nsegs = src.count_for(nbytes);
        if nsegs > CMAC_MAX_LL_NUM {
            error!(nsegs, "unsupported number of cmac segments");
            return Err(VseError::TooManySegments(nsegs, CMAC_MAX_LL_NUM));
        }

        let mut args = CmacArgs::new_zeroed();
        let bulk = blocks * AES_BLOCK_SIZE;
        let _ll = match blocks {
            0 => None,
            _ => {
                let ll = prepare_linked_list(
                    &dev.core.dma,
                    src,
                    bulk,
                    CMAC_MAX_LL_NUM,
                    AES_BLOCK_SIZE,
                )?;
                args.src = ll.first();
                Some(ll)
            }
        };
        args.src.hi.set(bulk as u32);

        if is_last {
            src.copy_to_buffer(nbytes - lastblock_len, &mut args.lastblock[..lastblock_len]);
        }
        args.keyslot.set(key.slot);
        args.key_length.set(key.keylen);
        args.config.set(match is_last {
            true => CMAC_CONFIG_LASTBLK,
            false => CMAC_CONFIG_NONLASTBLK,
        });
        args.lastblock_len.set(lastblock_len as u32);
        args.ivsel.set(match self.is_first {
            true => AES_IV_SEL_ORIGINAL,
            false => AES_IV_SEL_IV_REG,
        });
        args.dst = U64::new(u64::from(self.hash_result.addr()));
        self.hash_result.read_at(0, &mut args.cmac_reg);

        let kind = match is_last {
            true => OpKind::CmacProcess,
            false => OpKind::Process,
        };
        let mut msg = dev.request(CMD_AES_CMAC)?;
        msg.tx[0].set_cmac(args);
        let result = dev.submit_sync(&mut msg, kind)?;
        check_status(result.status)?;
        self.is_first = false;

        Ok(is_last.then_some(result.cmac))
    }
}
