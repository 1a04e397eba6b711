/*
 * Streaming SHA-1/SHA-2 on top of the engine's single-shot hash command.
 *
 * The engine hashes whole blocks and must see the final block in a call of
 * its own, so every stream keeps at least one byte (at most one block) back
 * as residual until it is finalized. Data reaches the engine either straight
 * from the caller's segments (fast path) or through a linear scratch buffer
 * (slow path).
 */
use std::sync::Arc;

use common::ivc::{
    length_words, SeAddr, ShaArgs, CMD_SHA_HASH, SHA_LENGTH_PAD, SHA_MAX_BLOCK_SIZE,
    SHA_MODE_SHA1, SHA_MODE_SHA224, SHA_MODE_SHA256, SHA_MODE_SHA384, SHA_MODE_SHA512,
};
use hex_literal::hex;
use tracing::{debug, error};
use zerocopy::little_endian::U64;
use zerocopy::FromZeros;

use crate::device::SeDevice;
use crate::dma::DmaBuffer;
use crate::error::{check_status, VseError};
use crate::pending::OpKind;
use crate::sg::{plan_descriptors, prepare_linked_list, LinkedList, ScatterList};

/// Descriptors allowed per hash command.
pub const SHA_MAX_LL_NUM: usize = 1;

const HASH_RESULT_SIZE: usize = SHA_MAX_BLOCK_SIZE * 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaAlg {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl ShaAlg {
    pub const ALL: [ShaAlg; 5] = [
        ShaAlg::Sha1,
        ShaAlg::Sha224,
        ShaAlg::Sha256,
        ShaAlg::Sha384,
        ShaAlg::Sha512,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ShaAlg::Sha1 => "sha1",
            ShaAlg::Sha224 => "sha224",
            ShaAlg::Sha256 => "sha256",
            ShaAlg::Sha384 => "sha384",
            ShaAlg::Sha512 => "sha512",
        }
    }

    pub fn digest_size(self) -> usize {
        match self {
            ShaAlg::Sha1 => 20,
            ShaAlg::Sha224 => 28,
            ShaAlg::Sha256 => 32,
            ShaAlg::Sha384 => 48,
            ShaAlg::Sha512 => 64,
        }
    }

    pub fn block_size(self) -> usize {
        match self {
            ShaAlg::Sha1 | ShaAlg::Sha224 | ShaAlg::Sha256 => 64,
            ShaAlg::Sha384 | ShaAlg::Sha512 => 128,
        }
    }

    pub fn from_digest_size(size: usize) -> Result<Self, VseError> {
        Self::ALL
            .into_iter()
            .find(|alg| alg.digest_size() == size)
            .ok_or(VseError::UnsupportedDigest(size))
    }

    pub(crate) fn mode(self) -> u32 {
        match self {
            ShaAlg::Sha1 => SHA_MODE_SHA1,
            ShaAlg::Sha224 => SHA_MODE_SHA224,
            ShaAlg::Sha256 => SHA_MODE_SHA256,
            ShaAlg::Sha384 => SHA_MODE_SHA384,
            ShaAlg::Sha512 => SHA_MODE_SHA512,
        }
    }

    /// Digest of the empty message. The engine cannot hash zero bytes.
    pub fn empty_digest(self) -> &'static [u8] {
        const SHA1: [u8; 20] = hex!("da39a3ee5e6b4b0d3255bfef95601890afd80709");
        const SHA224: [u8; 28] = hex!("d14a028c2a3a2bc9476102bb288234c415a2b01f828ea62ac5b3e42f");
        const SHA256: [u8; 32] =
            hex!("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855");
        const SHA384: [u8; 48] = hex!(
            "38b060a751ac96384cd9327eb1b1e36a21fdb71114be07434c0cc7bf63f6e1da"
            "274edebfe76f65fbd51ad2f14898b95b"
        );
        const SHA512: [u8; 64] = hex!(
            "cf83e1357eefb8bdf1542850d66d8007d620e4050b5715dc83f4a921d36ce9ce"
            "47d0d13c5d85f2b0ff8318d2877eec2f63b931bd47417a81a538327af927da3e"
        );
        match self {
            ShaAlg::Sha1 => &SHA1,
            ShaAlg::Sha224 => &SHA224,
            ShaAlg::Sha256 => &SHA256,
            ShaAlg::Sha384 => &SHA384,
            ShaAlg::Sha512 => &SHA512,
        }
    }
}

/// The four legal shapes of a hashing step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ShaOp {
    StreamUpdate,
    StreamFinalizeWithData,
    StreamFinalizeNoData,
    OneShotDigest,
}

impl ShaOp {
    fn is_last(self) -> bool {
        !matches!(self, ShaOp::StreamUpdate)
    }

    fn takes_data(self) -> bool {
        !matches!(self, ShaOp::StreamFinalizeNoData)
    }
}

/// Length fields of one hash command, as (total, left).
///
/// The final call carries the stream's grand total. Non-final calls carry
/// the call's byte count padded by 8, and by another 8 once the stream has
/// already issued a call.
pub(crate) fn frame_lengths(
    count: u64,
    total_count: u64,
    is_last: bool,
    is_first: bool,
) -> (u64, u64) {
    let pad = u64::from(SHA_LENGTH_PAD);
    if is_last {
        return (total_count, count);
    }
    let left = count + pad;
    match is_first {
        true => (left, left),
        false => (left + pad, left),
    }
}

struct ShaContext {
    alg: ShaAlg,
    sha_buf: DmaBuffer,
    hash_result: DmaBuffer,
    total_count: u64,
    residual: usize,
    is_first: bool,
    force_align: bool,
}

/// Streaming state captured by `export`. Restorable into any request of the
/// same algorithm.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaState {
    pub alg: ShaAlg,
    pub total_count: u64,
    pub residual: Vec<u8>,
    pub is_first: bool,
    pub force_align: bool,
    pub hash_result: Vec<u8>,
}

pub struct ShaSession {
    dev: Arc<SeDevice>,
    alg: ShaAlg,
}

impl ShaSession {
    pub(crate) fn new(dev: Arc<SeDevice>, alg: ShaAlg) -> Self {
        Self { dev, alg }
    }

    pub fn alg(&self) -> ShaAlg {
        self.alg
    }

    pub fn request(&self) -> ShaRequest {
        ShaRequest {
            dev: self.dev.clone(),
            alg: self.alg,
            ctx: None,
        }
    }
}

pub struct ShaRequest {
    dev: Arc<SeDevice>,
    alg: ShaAlg,
    ctx: Option<ShaContext>,
}

impl ShaRequest {
    pub fn is_initialized(&self) -> bool {
        self.ctx.is_some()
    }

    pub fn init(&mut self) -> Result<(), VseError> {
        self.dev.check_running()?;
        let alg = ShaAlg::from_digest_size(self.alg.digest_size())?;
        let dma = &self.dev.core.dma;
        let sha_buf = dma.alloc_coherent(self.dev.core.sha_buffer_size).inspect_err(|_| {
            error!("cannot allocate the hash scratch buffer");
        })?;
        let hash_result = dma.alloc_coherent(HASH_RESULT_SIZE).inspect_err(|_| {
            error!("cannot allocate the hash result buffer");
        })?;
        self.ctx = Some(ShaContext {
            alg,
            sha_buf,
            hash_result,
            total_count: 0,
            residual: 0,
            is_first: true,
            force_align: false,
        });
        Ok(())
    }

    pub fn update(&mut self, src: &ScatterList) -> Result<(), VseError> {
        self.step(ShaOp::StreamUpdate, src).map(|_| ())
    }

    /// Finishes the stream. The request must be re-initialized afterwards.
    pub fn finalize(&mut self) -> Result<Vec<u8>, VseError> {
        let out = self.step(ShaOp::StreamFinalizeNoData, &ScatterList::new());
        self.ctx = None;
        out
    }

    pub fn finup(&mut self, src: &ScatterList) -> Result<Vec<u8>, VseError> {
        let out = self.step(ShaOp::StreamFinalizeWithData, src);
        self.ctx = None;
        out
    }

    pub fn digest(&mut self, src: &ScatterList) -> Result<Vec<u8>, VseError> {
        self.dev.check_running()?;
        self.init()?;
        let out = self.step(ShaOp::OneShotDigest, src);
        self.ctx = None;
        out
    }

    pub fn export(&self) -> Result<ShaState, VseError> {
        let ctx = self.ctx.as_ref().ok_or(VseError::NotInitialized)?;
        let mut residual = vec![0; ctx.residual];
        ctx.sha_buf.read_at(0, &mut residual);
        Ok(ShaState {
            alg: ctx.alg,
            total_count: ctx.total_count,
            residual,
            is_first: ctx.is_first,
            force_align: ctx.force_align,
            hash_result: ctx.hash_result.with(<[u8]>::to_vec),
        })
    }

    pub fn import(&mut self, state: &ShaState) -> Result<(), VseError> {
        crate::ensure!(
            state.alg == self.alg
                && state.residual.len() <= state.alg.block_size()
                && state.hash_result.len() == HASH_RESULT_SIZE
        )?;
        if self.ctx.is_none() {
            self.init()?;
        }
        let ctx = self.ctx.as_mut().ok_or(VseError::NotInitialized)?;
        ctx.sha_buf.write_at(0, &state.residual);
        ctx.hash_result.write_at(0, &state.hash_result);
        ctx.total_count = state.total_count;
        ctx.residual = state.residual.len();
        ctx.is_first = state.is_first;
        ctx.force_align = state.force_align;
        Ok(())
    }

    fn step(&mut self, op: ShaOp, src: &ScatterList) -> Result<Vec<u8>, VseError> {
        let dev = self.dev.clone();
        dev.check_running()?;
        let ctx = self.ctx.as_mut().ok_or_else(|| {
            error!(?op, "hash request not initialized");
            VseError::NotInitialized
        })?;

        let _mtx = dev.mtx.lock();
        let out = ctx.run(&dev, op, src);
        if let Err(err) = &out {
            error!(alg = ctx.alg.name(), ?op, %err, "hash step failed");
        }
        out
    }
}

impl ShaContext {
    fn blk(&self) -> usize {
        self.alg.block_size()
    }

    fn run(
        &mut self,
        dev: &SeDevice,
        op: ShaOp,
        src: &ScatterList,
    ) -> Result<Vec<u8>, VseError> {
        let nbytes = if op.takes_data() { src.len() } else { 0 };

        if nbytes == 0 {
            if self.total_count == 0 {
                return Ok(match op.is_last() {
                    true => self.alg.empty_digest().to_vec(),
                    false => Vec::new(),
                });
            }
            if !op.is_last() {
                debug!("empty hash update");
                return Ok(Vec::new());
            }
            return self.finish(dev);
        }

        if self.fast_path_fits(src, nbytes) {
            self.fast_path(dev, src, nbytes)?;
        } else {
            self.slow_path(dev, src, nbytes)?;
        }

        match op.is_last() {
            true => self.finish(dev),
            false => Ok(Vec::new()),
        }
    }

    /// The fast path needs aligned residual state, at least one whole block
    /// in the input, and a block range that maps to few enough descriptors.
    fn fast_path_fits(&self, src: &ScatterList, nbytes: usize) -> bool {
        let blk = self.blk();
        let mut num_blks = nbytes / blk;
        if self.force_align || num_blks == 0 {
            return false;
        }
        if self.residual != 0 && self.residual != blk {
            return false;
        }
        if nbytes % blk == 0 {
            num_blks -= 1;
        }
        let lens = src.segments().iter().map(Vec::len);
        plan_descriptors(lens, num_blks * blk, blk).len() <= SHA_MAX_LL_NUM
    }

    fn fast_path(
        &mut self,
        dev: &SeDevice,
        src: &ScatterList,
        nbytes: usize,
    ) -> Result<(), VseError> {
        let blk = self.blk();
        if self.residual == blk {
            self.send_buffer(dev, blk, false)?;
            self.residual = 0;
        }

        let mut num_blks = nbytes / blk;
        let mut residual = nbytes - num_blks * blk;
        if residual == 0 {
            // hold the last block back for the final call
            residual = blk;
            num_blks -= 1;
        }
        let bulk = num_blks * blk;
        self.sha_buf
            .with_mut(|buf| src.copy_to_buffer(bulk, &mut buf[..residual]));
        self.residual = residual;
        self.total_count += residual as u64;

        if num_blks > 0 {
            let ll = prepare_linked_list(&dev.core.dma, src, bulk, SHA_MAX_LL_NUM, blk)?;
            self.total_count += bulk as u64;
            self.send(dev, &ll, bulk, false)?;
        }

        if self.residual < blk {
            self.force_align = true;
        }
        Ok(())
    }

    fn slow_path(
        &mut self,
        dev: &SeDevice,
        src: &ScatterList,
        nbytes: usize,
    ) -> Result<(), VseError> {
        let blk = self.blk();
        let buflen = dev.core.sha_buffer_size;

        let mut total = self.residual + nbytes;
        if total % blk == 0 {
            // hold the last block back for the final call
            total -= blk;
        }
        let mut offset = self.residual;
        let mut left = nbytes;
        let mut skip = 0;

        while total >= blk {
            let nblk_bytes = total / blk * blk;
            let length = nblk_bytes.min(buflen) - offset;
            self.sha_buf
                .with_mut(|buf| src.copy_to_buffer(skip, &mut buf[offset..offset + length]));
            skip += length;
            self.total_count += length as u64;

            self.send_buffer(dev, length + offset, false)?;
            total -= length + offset;
            left -= length;
            offset = 0;
        }

        self.sha_buf
            .with_mut(|buf| src.copy_to_buffer(skip, &mut buf[offset..offset + left]));
        self.total_count += left as u64;
        self.residual = offset + left;

        if self.force_align && self.residual == blk {
            // realigned; the next call may take the fast path
            self.force_align = false;
        }
        Ok(())
    }

    fn finish(&mut self, dev: &SeDevice) -> Result<Vec<u8>, VseError> {
        if self.residual > 0 {
            self.send_buffer(dev, self.residual, true)?;
            self.residual = 0;
        }
        let mut out = vec![0; self.alg.digest_size()];
        self.hash_result.read_at(0, &mut out);
        Ok(out)
    }

    /// Hashes the first `count` bytes of the scratch buffer.
    fn send_buffer(
        &mut self,
        dev: &SeDevice,
        count: usize,
        is_last: bool,
    ) -> Result<(), VseError> {
        let src = SeAddr::new(self.sha_buf.addr(), count as u32);
        self.send_one(dev, src, count, is_last)
    }

    fn send(
        &mut self,
        dev: &SeDevice,
        ll: &LinkedList,
        count: usize,
        is_last: bool,
    ) -> Result<(), VseError> {
        self.send_one(dev, ll.first(), count, is_last)
    }

    fn send_one(
        &mut self,
        dev: &SeDevice,
        src: SeAddr,
        count: usize,
        is_last: bool,
    ) -> Result<(), VseError> {
        let (total, left) = frame_lengths(count as u64, self.total_count, is_last, self.is_first);

        let mut args = ShaArgs::new_zeroed();
        args.mode.set(self.alg.mode());
        args.msg_total_length = length_words(total);
        args.msg_left_length = length_words(left);
        args.src = src;
        args.dst = U64::new(u64::from(self.hash_result.addr()));
        self.hash_result
            .read_at(0, &mut args.hash[..self.alg.digest_size()]);

        let mut msg = dev.request(CMD_SHA_HASH)?;
        msg.tx[0].set_sha(args);
        let result = dev.submit_sync(&mut msg, OpKind::Process)?;
        check_status(result.status)?;
        // cleared per engine call, so a step issuing two calls frames the
        // second as a continuation
        self.is_first = false;
        Ok(())
    }
}
