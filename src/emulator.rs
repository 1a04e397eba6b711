/*
 * Software security engine.
 *
 * Serves the far end of a loopback channel: a server thread decodes each
 * request frame, runs its entries against a 16-slot key table with real
 * AES/SHA/CMAC arithmetic over the shared DMA space, and raises the client's
 * interrupt after queuing the response. Faults can be injected per command
 * and every request is logged for inspection.
 */
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use common::ivc::{
    length_from_words, AesOpArgs, CmacArgs, Engine, IvcRxMsg, IvcTxMsg, KeyIvArgs,
    RxEntry, ShaArgs, TxEntry, AES_BLOCK_SIZE, AES_IV_SEL_IV_REG, AES_IV_SEL_ORIGINAL,
    AES_IV_SEL_UPDATED, AES_LCTR_CNTN, AES_MODE_CBC, AES_MODE_CTR, AES_MODE_ECB,
    CMAC_CONFIG_LASTBLK, CMD_AES_ALLOC_KEY, CMD_AES_CMAC, CMD_AES_CMAC_GEN_SUBKEY,
    CMD_AES_DECRYPT, CMD_AES_ENCRYPT, CMD_AES_RELEASE_KEY, CMD_AES_SET_KEY, CMD_SHA_HASH,
    IVC_MAGIC, IVC_MSG_SIZE, KEYSLOT_COUNT, KEYSLOT_LABEL, KEYTBL_TYPE_KEY, KEYTBL_TYPE_OIV,
    KEYTBL_TYPE_UIV, MAX_TASKS_PER_SUBMIT, SHA_LENGTH_PAD, SHA_MODE_SHA1, SHA_MODE_SHA224,
    SHA_MODE_SHA256, SHA_MODE_SHA384, SHA_MODE_SHA512, STATUS_INVALID_ARGS, STATUS_INVALID_CMD,
    STATUS_INVALID_KEY, STATUS_OK, STATUS_OP_ERROR,
};
use digest::generic_array::typenum::{U128, U64};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};
use zerocopy::{FromBytes, FromZeros, IntoBytes};
use zeroize::Zeroizing;

use crate::dma::DmaSpace;
use crate::error::EAGAIN;
use crate::ivc::{IrqHandler, IvcChannel};

type Status = u32;

#[derive(Clone, Copy, Debug)]
pub struct EmulatorConfig {
    /// Frame size the channel advertises.
    pub frame_size: usize,
    /// Frames each direction of the channel holds.
    pub channel_frames: usize,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            frame_size: IVC_MSG_SIZE,
            channel_frames: 16,
        }
    }
}

#[derive(Default)]
struct Rings {
    to_server: VecDeque<Vec<u8>>,
    to_client: VecDeque<Vec<u8>>,
    stop: bool,
}

struct Link {
    rings: Mutex<Rings>,
    server_wake: Condvar,
    irq: Mutex<Option<IrqHandler>>,
    established: AtomicBool,
    frame_size: usize,
    capacity: usize,
}

impl Link {
    fn raise_irq(&self) {
        if let Some(handler) = self.irq.lock().as_ref() {
            handler();
        }
    }
}

/// Client end of the loopback channel.
pub struct LoopbackChannel {
    link: Arc<Link>,
}

impl IvcChannel for LoopbackChannel {
    fn frame_size(&self) -> usize {
        self.link.frame_size
    }

    fn is_established(&self) -> bool {
        self.link.established.load(Ordering::Acquire)
    }

    fn can_write(&self) -> bool {
        self.link.rings.lock().to_server.len() < self.link.capacity
    }

    fn can_read(&self) -> bool {
        !self.link.rings.lock().to_client.is_empty()
    }

    fn write(&self, frame: &[u8]) -> Result<usize, i32> {
        let mut rings = self.link.rings.lock();
        if rings.to_server.len() >= self.link.capacity {
            return Err(-EAGAIN);
        }
        rings.to_server.push_back(frame.to_vec());
        self.link.server_wake.notify_all();
        Ok(frame.len())
    }

    fn read(&self, frame: &mut [u8]) -> Result<usize, i32> {
        let msg = self.link.rings.lock().to_client.pop_front().ok_or(-EAGAIN)?;
        let len = msg.len().min(frame.len());
        frame[..len].copy_from_slice(&msg[..len]);
        Ok(len)
    }

    fn set_irq_handler(&self, handler: IrqHandler) {
        *self.link.irq.lock() = Some(handler);
    }
}

/// One request message as the engine received it.
#[derive(Clone, Debug)]
pub struct LoggedMsg {
    pub engine: u32,
    pub num_reqs: u32,
    pub tag: [u8; 16],
    pub entries: Vec<TxEntry>,
}

impl LoggedMsg {
    pub fn cmds(&self) -> Vec<u32> {
        self.entries.iter().map(|e| e.cmd.get()).collect()
    }
}

#[derive(Default)]
struct Faults {
    forced: HashMap<u32, Status>,
    hold: bool,
    held: Vec<Vec<u8>>,
    drop_next: u32,
    last: Option<Vec<u8>>,
}

struct KeySlot {
    allocated: bool,
    provisioned: bool,
    key: Zeroizing<Vec<u8>>,
    oiv: [u8; AES_BLOCK_SIZE],
    uiv: [u8; AES_BLOCK_SIZE],
    subkeys: Option<([u8; AES_BLOCK_SIZE], [u8; AES_BLOCK_SIZE])>,
}

impl Default for KeySlot {
    fn default() -> Self {
        Self {
            allocated: false,
            provisioned: false,
            key: Zeroizing::new(Vec::new()),
            oiv: [0; AES_BLOCK_SIZE],
            uiv: [0; AES_BLOCK_SIZE],
            subkeys: None,
        }
    }
}

struct Server {
    link: Arc<Link>,
    dma: Arc<DmaSpace>,
    keys: Mutex<Vec<KeySlot>>,
    faults: Mutex<Faults>,
    log: Mutex<Vec<LoggedMsg>>,
}

pub struct Emulator {
    server: Arc<Server>,
    channel: Arc<LoopbackChannel>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Emulator {
    pub fn start(dma: Arc<DmaSpace>) -> std::io::Result<Self> {
        Self::with_config(dma, EmulatorConfig::default())
    }

    pub fn with_config(dma: Arc<DmaSpace>, config: EmulatorConfig) -> std::io::Result<Self> {
        let link = Arc::new(Link {
            rings: Mutex::new(Rings::default()),
            server_wake: Condvar::new(),
            irq: Mutex::new(None),
            established: AtomicBool::new(true),
            frame_size: config.frame_size,
            capacity: config.channel_frames.max(1),
        });
        let server = Arc::new(Server {
            link: link.clone(),
            dma,
            keys: Mutex::new((0..KEYSLOT_COUNT).map(|_| KeySlot::default()).collect()),
            faults: Mutex::new(Faults::default()),
            log: Mutex::new(Vec::new()),
        });

        let worker = server.clone();
        let thread = std::thread::Builder::new()
            .name("vse-emulator".into())
            .spawn(move || worker.run())?;

        Ok(Self {
            server,
            channel: Arc::new(LoopbackChannel { link }),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn channel(&self) -> Arc<LoopbackChannel> {
        self.channel.clone()
    }

    /// Installs a fixed key in `slot`, reachable only through a label.
    pub fn provision_label_slot(&self, slot: u32, key: &[u8]) {
        let mut keys = self.server.keys.lock();
        if let Some(entry) = keys.get_mut(slot as usize) {
            *entry = KeySlot {
                provisioned: true,
                key: Zeroizing::new(key.to_vec()),
                ..KeySlot::default()
            };
        }
    }

    /// Slots currently handed out by allocation.
    pub fn allocated_slots(&self) -> Vec<u32> {
        let keys = self.server.keys.lock();
        (0..KEYSLOT_COUNT)
            .filter(|&s| keys[s as usize].allocated)
            .collect()
    }

    /// Answers every entry carrying `cmd` with `status`, without executing it.
    pub fn force_status(&self, cmd: u32, status: u32) {
        self.server.faults.lock().forced.insert(cmd, status);
    }

    pub fn clear_forced_status(&self) {
        self.server.faults.lock().forced.clear();
    }

    /// While set, responses are kept back instead of delivered.
    /// Clearing it delivers everything kept.
    pub fn hold_responses(&self, hold: bool) {
        self.server.faults.lock().hold = hold;
        if !hold {
            self.release_held();
        }
    }

    pub fn held(&self) -> usize {
        self.server.faults.lock().held.len()
    }

    /// Delivers the kept responses in order. Returns how many.
    pub fn release_held(&self) -> usize {
        let held = std::mem::take(&mut self.server.faults.lock().held);
        let count = held.len();
        for rsp in held {
            self.server.push_to_client(rsp);
        }
        count
    }

    /// Discards the next `count` responses.
    pub fn drop_responses(&self, count: u32) {
        self.server.faults.lock().drop_next = count;
    }

    /// Delivers the most recent response a second time.
    pub fn replay_last(&self) -> bool {
        let last = self.server.faults.lock().last.clone();
        match last {
            Some(rsp) => {
                self.server.push_to_client(rsp);
                true
            }
            None => false,
        }
    }

    /// Puts the channel in or out of its reset handshake.
    pub fn set_established(&self, established: bool) {
        self.server
            .link
            .established
            .store(established, Ordering::Release);
    }

    pub fn messages(&self) -> Vec<LoggedMsg> {
        self.server.log.lock().clone()
    }

    pub fn clear_log(&self) {
        self.server.log.lock().clear();
    }

    pub fn stop(&self) {
        {
            let mut rings = self.server.link.rings.lock();
            rings.stop = true;
            self.server.link.server_wake.notify_all();
        }
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!("emulator thread panicked");
            }
        }
    }
}

impl Drop for Emulator {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Server {
    fn run(&self) {
        loop {
            let frame = {
                let mut rings = self.link.rings.lock();
                loop {
                    if rings.stop {
                        debug!("emulator stopped");
                        return;
                    }
                    if let Some(frame) = rings.to_server.pop_front() {
                        break frame;
                    }
                    self.link.server_wake.wait(&mut rings);
                }
            };
            if let Some(rsp) = self.handle(&frame) {
                self.deliver(rsp);
            }
        }
    }

    fn push_to_client(&self, rsp: Vec<u8>) {
        self.link.rings.lock().to_client.push_back(rsp);
        self.link.raise_irq();
    }

    fn deliver(&self, rsp: Vec<u8>) {
        {
            let mut faults = self.faults.lock();
            if faults.drop_next > 0 {
                faults.drop_next -= 1;
                debug!("dropping response");
                return;
            }
            faults.last = Some(rsp.clone());
            if faults.hold {
                faults.held.push(rsp);
                return;
            }
        }
        self.push_to_client(rsp);
    }

    fn handle(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let Ok(req) = IvcTxMsg::ref_from_bytes(frame) else {
            warn!(len = frame.len(), "emulator: malformed request frame");
            return None;
        };
        if req.hdr.magic != IVC_MAGIC {
            warn!("emulator: bad header magic");
            return None;
        }

        let num_reqs = req.hdr.num_reqs.get();
        let count = num_reqs as usize;
        let engine = Engine::from_id(req.hdr.engine.get());
        self.log.lock().push(LoggedMsg {
            engine: req.hdr.engine.get(),
            num_reqs,
            tag: req.hdr.tag,
            entries: req.tx.iter().take(count).copied().collect(),
        });

        let mut rsp = IvcRxMsg::new_box_zeroed().ok()?;
        rsp.hdr = req.hdr;
        if count == 0 || count > MAX_TASKS_PER_SUBMIT {
            rsp.hdr.status.set(STATUS_INVALID_ARGS);
            return Some(rsp.as_bytes().to_vec());
        }

        for (tx, rx) in req.tx.iter().zip(rsp.rx.iter_mut()).take(count) {
            self.execute(engine, tx, rx);
        }
        Some(rsp.as_bytes().to_vec())
    }

    fn execute(&self, engine: Option<Engine>, tx: &TxEntry, rx: &mut RxEntry) {
        let cmd = tx.cmd.get();
        rx.tag = tx.tag;
        rx.cmd = tx.cmd;

        let forced = self.faults.lock().forced.get(&cmd).copied();
        let outcome = match forced {
            Some(status) => Err(status),
            None => self.dispatch(engine, cmd, tx),
        };
        match outcome {
            Ok(result) => {
                rx.status.set(STATUS_OK);
                rx.result = result;
            }
            Err(status) => {
                trace!(cmd, status, "emulator: entry failed");
                rx.status.set(status);
            }
        }
    }

    fn dispatch(
        &self,
        engine: Option<Engine>,
        cmd: u32,
        tx: &TxEntry,
    ) -> Result<[u8; 16], Status> {
        let is_aes = matches!(engine, Some(Engine::Aes0 | Engine::Aes1));
        let is_sha = engine == Some(Engine::Sha);
        match cmd {
            CMD_SHA_HASH if is_sha => self.sha_hash(&tx.sha()).map(|()| [0; 16]),
            CMD_AES_ALLOC_KEY if is_aes => self.alloc_key(),
            CMD_AES_SET_KEY if is_aes => self.set_key(&tx.key_iv()).map(|()| [0; 16]),
            CMD_AES_RELEASE_KEY if is_aes => self.release_key(&tx.key_iv()).map(|()| [0; 16]),
            CMD_AES_ENCRYPT if is_aes => self.aes_crypt(&tx.aes_op(), true),
            CMD_AES_DECRYPT if is_aes => self.aes_crypt(&tx.aes_op(), false),
            CMD_AES_CMAC_GEN_SUBKEY if is_aes => {
                self.gen_subkey(tx.cmac_subkey().keyslot.get()).map(|()| [0; 16])
            }
            CMD_AES_CMAC if is_aes => self.cmac(&tx.cmac()),
            _ => {
                warn!(cmd, engine = ?engine, "emulator: unsupported command");
                Err(STATUS_INVALID_CMD)
            }
        }
    }

    fn alloc_key(&self) -> Result<[u8; 16], Status> {
        let mut keys = self.keys.lock();
        let slot = keys
            .iter()
            .position(|k| !k.allocated && !k.provisioned)
            .ok_or(STATUS_OP_ERROR)?;
        keys[slot] = KeySlot {
            allocated: true,
            ..KeySlot::default()
        };
        let mut result = [0; 16];
        result[0] = slot as u8;
        Ok(result)
    }

    fn set_key(&self, args: &KeyIvArgs) -> Result<(), Status> {
        let mut keys = self.keys.lock();
        let slot = keys
            .get_mut(args.slot.get() as usize)
            .ok_or(STATUS_INVALID_ARGS)?;
        if !slot.allocated && !slot.provisioned {
            return Err(STATUS_INVALID_KEY);
        }

        let ty = args.key_type.get();
        if ty & KEYTBL_TYPE_KEY != 0 {
            let is_label = args.data.starts_with(KEYSLOT_LABEL.as_bytes());
            match (slot.provisioned, is_label) {
                // provisioned material stays in place
                (true, true) => {}
                (true, false) | (false, true) => return Err(STATUS_INVALID_KEY),
                (false, false) => {
                    let len = args.length.get() as usize;
                    if !matches!(len, 16 | 24 | 32) {
                        return Err(STATUS_INVALID_ARGS);
                    }
                    slot.key = Zeroizing::new(args.data[..len].to_vec());
                }
            }
            slot.subkeys = None;
        }
        if ty & KEYTBL_TYPE_OIV != 0 {
            slot.oiv = args.oiv;
        }
        if ty & KEYTBL_TYPE_UIV != 0 {
            slot.uiv = args.uiv;
        }
        Ok(())
    }

    fn release_key(&self, args: &KeyIvArgs) -> Result<(), Status> {
        let mut keys = self.keys.lock();
        let slot = keys
            .get_mut(args.slot.get() as usize)
            .ok_or(STATUS_INVALID_ARGS)?;
        if !slot.allocated {
            return Err(STATUS_INVALID_ARGS);
        }
        *slot = KeySlot::default();
        Ok(())
    }

    fn cipher_for(slot: &KeySlot) -> Result<BlockCipher, Status> {
        BlockCipher::new(&slot.key).ok_or(STATUS_INVALID_KEY)
    }

    fn aes_crypt(&self, args: &AesOpArgs, encrypt: bool) -> Result<[u8; 16], Status> {
        let mut keys = self.keys.lock();
        let slot = keys
            .get_mut(args.keyslot.get() as usize)
            .ok_or(STATUS_INVALID_ARGS)?;
        let cipher = Self::cipher_for(slot)?;

        let len = args.src.hi.get() as usize;
        if args.dst.hi.get() as usize != len {
            return Err(STATUS_INVALID_ARGS);
        }
        let mut data = self
            .dma
            .read(u64::from(args.src.lo.get()), len)
            .ok_or(STATUS_OP_ERROR)?;

        let result = match args.mode.get() {
            AES_MODE_CBC => {
                if len % AES_BLOCK_SIZE != 0 {
                    return Err(STATUS_INVALID_ARGS);
                }
                let mut iv = match args.ivsel.get() {
                    AES_IV_SEL_IV_REG => args.lctr,
                    AES_IV_SEL_ORIGINAL => slot.oiv,
                    AES_IV_SEL_UPDATED => slot.uiv,
                    _ => return Err(STATUS_INVALID_ARGS),
                };
                for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
                    let mut b = [0u8; AES_BLOCK_SIZE];
                    b.copy_from_slice(block);
                    if encrypt {
                        xor_in(&mut b, &iv);
                        cipher.encrypt(&mut b);
                        iv = b;
                    } else {
                        let ct = b;
                        cipher.decrypt(&mut b);
                        xor_in(&mut b, &iv);
                        iv = ct;
                    }
                    block.copy_from_slice(&b);
                }
                slot.uiv = iv;
                iv
            }
            AES_MODE_ECB => {
                if len % AES_BLOCK_SIZE != 0 {
                    return Err(STATUS_INVALID_ARGS);
                }
                for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
                    let mut b = [0u8; AES_BLOCK_SIZE];
                    b.copy_from_slice(block);
                    match encrypt {
                        true => cipher.encrypt(&mut b),
                        false => cipher.decrypt(&mut b),
                    }
                    block.copy_from_slice(&b);
                }
                [0; 16]
            }
            AES_MODE_CTR => {
                let mut ctr = match args.ctr_cntn.get() {
                    AES_LCTR_CNTN => args.lctr,
                    _ => slot.oiv,
                };
                for chunk in data.chunks_mut(AES_BLOCK_SIZE) {
                    let mut ks = ctr;
                    cipher.encrypt(&mut ks);
                    for (d, k) in chunk.iter_mut().zip(ks) {
                        *d ^= k;
                    }
                    ctr = (u128::from_be_bytes(ctr).wrapping_add(1)).to_be_bytes();
                }
                ctr
            }
            _ => return Err(STATUS_INVALID_ARGS),
        };

        if !self.dma.write(u64::from(args.dst.lo.get()), &data) {
            return Err(STATUS_OP_ERROR);
        }
        Ok(result)
    }

    fn gen_subkey(&self, slot: u32) -> Result<(), Status> {
        let mut keys = self.keys.lock();
        let slot = keys.get_mut(slot as usize).ok_or(STATUS_INVALID_ARGS)?;
        let cipher = Self::cipher_for(slot)?;
        let mut l = [0u8; AES_BLOCK_SIZE];
        cipher.encrypt(&mut l);
        let k1 = dbl(&l);
        let k2 = dbl(&k1);
        slot.subkeys = Some((k1, k2));
        Ok(())
    }

    fn cmac(&self, args: &CmacArgs) -> Result<[u8; 16], Status> {
        let keys = self.keys.lock();
        let slot = keys
            .get(args.keyslot.get() as usize)
            .ok_or(STATUS_INVALID_ARGS)?;
        let cipher = Self::cipher_for(slot)?;
        let (k1, k2) = slot.subkeys.ok_or(STATUS_INVALID_KEY)?;

        let len = args.src.hi.get() as usize;
        if len % AES_BLOCK_SIZE != 0 {
            return Err(STATUS_INVALID_ARGS);
        }
        let data = match len {
            0 => Vec::new(),
            _ => self
                .dma
                .read(u64::from(args.src.lo.get()), len)
                .ok_or(STATUS_OP_ERROR)?,
        };

        let mut state = match args.ivsel.get() {
            AES_IV_SEL_ORIGINAL => [0u8; AES_BLOCK_SIZE],
            _ => args.cmac_reg,
        };
        for block in data.chunks_exact(AES_BLOCK_SIZE) {
            xor_in(&mut state, block);
            cipher.encrypt(&mut state);
        }

        let last_len = args.lastblock_len.get() as usize;
        if args.config.get() != CMAC_CONFIG_LASTBLK {
            if last_len != 0 {
                return Err(STATUS_INVALID_ARGS);
            }
            let dst = args.dst.get();
            if !self.dma.write(dst, &state) {
                return Err(STATUS_OP_ERROR);
            }
            return Ok([0; 16]);
        }

        if last_len > AES_BLOCK_SIZE {
            return Err(STATUS_INVALID_ARGS);
        }
        let mut last = [0u8; AES_BLOCK_SIZE];
        last[..last_len].copy_from_slice(&args.lastblock[..last_len]);
        if last_len == AES_BLOCK_SIZE {
            xor_in(&mut last, &k1);
        } else {
            last[last_len] = 0x80;
            xor_in(&mut last, &k2);
        }
        xor_in(&mut state, &last);
        cipher.encrypt(&mut state);
        Ok(state)
    }

    fn sha_hash(&self, args: &ShaArgs) -> Result<(), Status> {
        let kind = ShaKind::from_mode(args.mode.get()).ok_or(STATUS_INVALID_ARGS)?;
        let blk = kind.block_size();
        let total = length_from_words(&args.msg_total_length);
        let left = length_from_words(&args.msg_left_length);
        let count = u64::from(args.src.hi.get());
        let pad = u64::from(SHA_LENGTH_PAD);

        // a final call carries its own byte count; other calls are padded
        let is_last = left == count;
        let is_first = match is_last {
            true => total == count,
            false if left == count + pad && total == left => true,
            false if left == count + pad && total == left + pad => false,
            false => return Err(STATUS_INVALID_ARGS),
        };
        if !is_last && count % blk as u64 != 0 {
            return Err(STATUS_INVALID_ARGS);
        }

        let data = match count {
            0 => Vec::new(),
            _ => self
                .dma
                .read(u64::from(args.src.lo.get()), count as usize)
                .ok_or(STATUS_OP_ERROR)?,
        };
        let dst = args.dst.get();
        let mut chain = match is_first {
            true => kind.initial(),
            false => {
                let saved = self
                    .dma
                    .read(dst, kind.state_size())
                    .ok_or(STATUS_OP_ERROR)?;
                kind.load(&saved)
            }
        };

        if is_last {
            let mut padded = data;
            let len_field = if blk == 128 { 16 } else { 8 };
            padded.push(0x80);
            while padded.len() % blk != blk - len_field {
                padded.push(0);
            }
            let bits = u128::from(total) * 8;
            match len_field {
                16 => padded.extend_from_slice(&bits.to_be_bytes()),
                _ => padded.extend_from_slice(&(bits as u64).to_be_bytes()),
            }
            chain.compress(&padded);
        } else {
            chain.compress(&data);
        }

        if !self.dma.write(dst, &chain.store()) {
            return Err(STATUS_OP_ERROR);
        }
        Ok(())
    }
}

fn xor_in(dst: &mut [u8; AES_BLOCK_SIZE], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}

/// Doubling in GF(2^128), as CMAC derives its subkeys.
fn dbl(block: &[u8; AES_BLOCK_SIZE]) -> [u8; AES_BLOCK_SIZE] {
    let v = u128::from_be_bytes(*block);
    let mut out = v << 1;
    if v >> 127 == 1 {
        out ^= 0x87;
    }
    out.to_be_bytes()
}

enum BlockCipher {
    Aes128(aes::Aes128),
    Aes192(aes::Aes192),
    Aes256(aes::Aes256),
}

impl BlockCipher {
    fn new(key: &[u8]) -> Option<Self> {
        match key.len() {
            16 => aes::Aes128::new_from_slice(key).ok().map(Self::Aes128),
            24 => aes::Aes192::new_from_slice(key).ok().map(Self::Aes192),
            32 => aes::Aes256::new_from_slice(key).ok().map(Self::Aes256),
            _ => None,
        }
    }

    fn encrypt(&self, block: &mut [u8; AES_BLOCK_SIZE]) {
        let b = GenericArray::from_mut_slice(block);
        match self {
            Self::Aes128(c) => c.encrypt_block(b),
            Self::Aes192(c) => c.encrypt_block(b),
            Self::Aes256(c) => c.encrypt_block(b),
        }
    }

    fn decrypt(&self, block: &mut [u8; AES_BLOCK_SIZE]) {
        let b = GenericArray::from_mut_slice(block);
        match self {
            Self::Aes128(c) => c.decrypt_block(b),
            Self::Aes192(c) => c.decrypt_block(b),
            Self::Aes256(c) => c.decrypt_block(b),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ShaKind {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

const SHA1_H0: [u32; 5] = [0x67452301, 0xefcdab89, 0x98badcfe, 0x10325476, 0xc3d2e1f0];
const SHA224_H0: [u32; 8] = [
    0xc1059ed8, 0x367cd507, 0x3070dd17, 0xf70e5939, 0xffc00b31, 0x68581511, 0x64f98fa7, 0xbefa4fa4,
];
const SHA256_H0: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];
const SHA384_H0: [u64; 8] = [
    0xcbbb9d5dc1059ed8,
    0x629a292a367cd507,
    0x9159015a3070dd17,
    0x152fecd8f70e5939,
    0x67332667ffc00b31,
    0x8eb44a8768581511,
    0xdb0c2e0d64f98fa7,
    0x47b5481dbefa4fa4,
];
const SHA512_H0: [u64; 8] = [
    0x6a09e667f3bcc908,
    0xbb67ae8584caa73b,
    0x3c6ef372fe94f82b,
    0xa54ff53a5f1d36f1,
    0x510e527fade682d1,
    0x9b05688c2b3e6c1f,
    0x1f83d9abfb41bd6b,
    0x5be0cd19137e2179,
];

impl ShaKind {
    fn from_mode(mode: u32) -> Option<Self> {
        match mode {
            SHA_MODE_SHA1 => Some(Self::Sha1),
            SHA_MODE_SHA224 => Some(Self::Sha224),
            SHA_MODE_SHA256 => Some(Self::Sha256),
            SHA_MODE_SHA384 => Some(Self::Sha384),
            SHA_MODE_SHA512 => Some(Self::Sha512),
            _ => None,
        }
    }

    fn block_size(self) -> usize {
        match self {
            Self::Sha1 | Self::Sha224 | Self::Sha256 => 64,
            Self::Sha384 | Self::Sha512 => 128,
        }
    }

    /// Bytes of chaining state kept in the result buffer between calls.
    fn state_size(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha224 | Self::Sha256 => 32,
            Self::Sha384 | Self::Sha512 => 64,
        }
    }

    fn initial(self) -> Chain {
        match self {
            Self::Sha1 => Chain::Sha1(SHA1_H0),
            Self::Sha224 => Chain::Sha256(SHA224_H0),
            Self::Sha256 => Chain::Sha256(SHA256_H0),
            Self::Sha384 => Chain::Sha512(SHA384_H0),
            Self::Sha512 => Chain::Sha512(SHA512_H0),
        }
    }

    fn load(self, bytes: &[u8]) -> Chain {
        let mut chain = self.initial();
        match &mut chain {
            Chain::Sha1(s) => load_words(s, bytes, u32::from_be_bytes),
            Chain::Sha256(s) => load_words(s, bytes, u32::from_be_bytes),
            Chain::Sha512(s) => load_words(s, bytes, u64::from_be_bytes),
        }
        chain
    }
}

fn load_words<T, const N: usize>(words: &mut [T], bytes: &[u8], decode: fn([u8; N]) -> T) {
    for (w, chunk) in words.iter_mut().zip(bytes.chunks_exact(N)) {
        let mut raw = [0u8; N];
        raw.copy_from_slice(chunk);
        *w = decode(raw);
    }
}

/// SHA chaining state, stored big-endian in the engine's result buffer.
enum Chain {
    Sha1([u32; 5]),
    Sha256([u32; 8]),
    Sha512([u64; 8]),
}

impl Chain {
    /// `data` must be a whole number of blocks.
    fn compress(&mut self, data: &[u8]) {
        match self {
            Chain::Sha1(s) => {
                let blocks: Vec<GenericArray<u8, U64>> =
                    data.chunks_exact(64).map(GenericArray::clone_from_slice).collect();
                sha1::compress(s, &blocks);
            }
            Chain::Sha256(s) => {
                let blocks: Vec<GenericArray<u8, U64>> =
                    data.chunks_exact(64).map(GenericArray::clone_from_slice).collect();
                sha2::compress256(s, &blocks);
            }
            Chain::Sha512(s) => {
                let blocks: Vec<GenericArray<u8, U128>> =
                    data.chunks_exact(128).map(GenericArray::clone_from_slice).collect();
                sha2::compress512(s, &blocks);
            }
        }
    }

    fn store(&self) -> Vec<u8> {
        match self {
            Chain::Sha1(s) => s.iter().flat_map(|w| w.to_be_bytes()).collect(),
            Chain::Sha256(s) => s.iter().flat_map(|w| w.to_be_bytes()).collect(),
            Chain::Sha512(s) => s.iter().flat_map(|w| w.to_be_bytes()).collect(),
        }
    }
}
