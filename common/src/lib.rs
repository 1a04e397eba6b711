#![no_std]

/*
 * Wire protocol spoken with the virtualized security engine over the
 * inter-VM channel. Every structure here is byte-for-byte the layout the
 * engine firmware expects: little-endian, C ordering, no implicit padding.
 */
pub mod ivc {
    use zerocopy::little_endian::{U32, U64};
    use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

    pub const IVC_MAGIC: [u8; 4] = *b"NVDA";

    pub const MAX_TASKS_PER_SUBMIT: usize = 64;
    pub const TX_ARGS_SIZE: usize = 120;
    pub const TX_ENTRY_SIZE: usize = 128;
    pub const RX_ENTRY_SIZE: usize = 28;
    pub const IVC_HEADER_SIZE: usize = 32;
    pub const IVC_MSG_SIZE: usize = IVC_HEADER_SIZE + MAX_TASKS_PER_SUBMIT * TX_ENTRY_SIZE;

    // Command codes
    pub const CMD_AES_ALLOC_KEY: u32 = 0xF0;
    pub const CMD_AES_SET_KEY: u32 = 0xF1;
    pub const CMD_AES_RELEASE_KEY: u32 = 0x20;
    pub const CMD_AES_ENCRYPT: u32 = 0x21;
    pub const CMD_AES_DECRYPT: u32 = 0x22;
    pub const CMD_AES_CMAC: u32 = 0x23;
    pub const CMD_AES_CMAC_GEN_SUBKEY: u32 = 0x24;
    pub const CMD_SHA_HASH: u32 = 16;

    // Status words returned by the engine
    pub const STATUS_OK: u32 = 0;
    pub const STATUS_INVALID_CMD: u32 = 1;
    pub const STATUS_OP_ERROR: u32 = 2;
    pub const STATUS_INVALID_ARGS: u32 = 3;
    pub const STATUS_INVALID_KEY: u32 = 4;

    // Key table entry types, combinable
    pub const KEYTBL_TYPE_KEY: u32 = 1;
    pub const KEYTBL_TYPE_OIV: u32 = 2;
    pub const KEYTBL_TYPE_UIV: u32 = 4;

    pub const AES_MODE_CBC: u32 = 0;
    pub const AES_MODE_ECB: u32 = 1;
    pub const AES_MODE_CTR: u32 = 2;

    pub const AES_IV_SEL_ORIGINAL: u32 = 0;
    pub const AES_IV_SEL_UPDATED: u32 = 1;
    pub const AES_IV_SEL_IV_REG: u32 = 2;

    pub const AES_LCTR_CNTN: u32 = 1;

    pub const CMAC_CONFIG_NONLASTBLK: u32 = 0x00;
    pub const CMAC_CONFIG_LASTBLK: u32 = 0x01;

    pub const SHA_MODE_SHA1: u32 = 0;
    pub const SHA_MODE_SHA224: u32 = 4;
    pub const SHA_MODE_SHA256: u32 = 5;
    pub const SHA_MODE_SHA384: u32 = 6;
    pub const SHA_MODE_SHA512: u32 = 7;

    pub const AES_BLOCK_SIZE: usize = 16;
    pub const AES_IV_SIZE: usize = 16;
    pub const AES_MIN_KEY_SIZE: usize = 16;
    pub const AES_MAX_KEY_SIZE: usize = 32;
    pub const CMAC_DIGEST_SIZE: usize = 16;
    pub const SHA_MAX_BLOCK_SIZE: usize = 128;
    pub const SHA_MAX_DIGEST_SIZE: usize = 64;

    /// Non-final hash calls carry their lengths padded by this many bytes.
    pub const SHA_LENGTH_PAD: u32 = 8;

    /// Largest single DMA descriptor the engine accepts.
    pub const MAX_BUFFER_SIZE: usize = 0x100_0000;

    pub const KEYSLOT_COUNT: u32 = 16;
    pub const KEYSLOT_LABEL: &str = "NVSEAES";

    #[repr(u32)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub enum Engine {
        Aes0 = 0,
        Aes1 = 1,
        Sha = 3,
    }

    impl Engine {
        pub const ALL: [Engine; 3] = [Engine::Aes0, Engine::Aes1, Engine::Sha];

        pub fn from_id(id: u32) -> Option<Self> {
            match id {
                0 => Some(Engine::Aes0),
                1 => Some(Engine::Aes1),
                3 => Some(Engine::Sha),
                _ => None,
            }
        }

        pub fn id(self) -> u32 {
            self as u32
        }

        pub fn index(self) -> usize {
            match self {
                Engine::Aes0 => 0,
                Engine::Aes1 => 1,
                Engine::Sha => 2,
            }
        }
    }

    #[repr(C)]
    #[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug, Default)]
    pub struct SeAddr {
        pub lo: U32,
        pub hi: U32,
    }

    impl SeAddr {
        pub fn new(addr: u32, len: u32) -> Self {
            Self {
                lo: U32::new(addr),
                hi: U32::new(len),
            }
        }
    }

    #[repr(C)]
    #[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
    pub struct IvcHeader {
        pub magic: [u8; 4],
        pub num_reqs: U32,
        pub engine: U32,
        pub tag: [u8; 16],
        pub status: U32,
    }

    #[repr(C)]
    #[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
    pub struct TxEntry {
        pub tag: U32,
        pub cmd: U32,
        pub args: [u8; TX_ARGS_SIZE],
    }

    #[repr(C)]
    #[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
    pub struct RxEntry {
        pub tag: U32,
        pub cmd: U32,
        pub status: U32,
        /// CBC output IV, CMAC result, or the allocated keyslot in byte 0.
        pub result: [u8; 16],
    }

    /// Request direction of a channel message.
    #[repr(C)]
    #[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
    pub struct IvcTxMsg {
        pub hdr: IvcHeader,
        pub tx: [TxEntry; MAX_TASKS_PER_SUBMIT],
    }

    /// Response direction of a channel message. Shares the request's frame size.
    #[repr(C)]
    #[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
    pub struct IvcRxMsg {
        pub hdr: IvcHeader,
        pub rx: [RxEntry; MAX_TASKS_PER_SUBMIT],
        pub _rsvd: [u8; MAX_TASKS_PER_SUBMIT * (TX_ENTRY_SIZE - RX_ENTRY_SIZE)],
    }

    impl IvcHeader {
        pub fn new(engine: Engine, num_reqs: u32) -> Self {
            Self {
                magic: IVC_MAGIC,
                num_reqs: U32::new(num_reqs),
                engine: U32::new(engine.id()),
                tag: [0; 16],
                status: U32::ZERO,
            }
        }
    }

    #[repr(C)]
    #[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
    pub struct KeyIvArgs {
        pub slot: U32,
        pub length: U32,
        pub key_type: U32,
        pub data: [u8; 32],
        pub oiv: [u8; AES_IV_SIZE],
        pub uiv: [u8; AES_IV_SIZE],
        pub _rsvd: [u8; 44],
    }

    #[repr(C)]
    #[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
    pub struct AesOpArgs {
        pub keyslot: U32,
        pub mode: U32,
        pub ivsel: U32,
        pub lctr: [u8; 16],
        pub ctr_cntn: U32,
        pub src: SeAddr,
        pub dst: SeAddr,
        pub key_length: U32,
        pub _rsvd: [u8; 68],
    }

    #[repr(C)]
    #[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
    pub struct CmacSubkeyArgs {
        pub keyslot: U32,
        pub key_length: U32,
        pub _rsvd: [u8; 112],
    }

    #[repr(C)]
    #[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
    pub struct CmacArgs {
        pub keyslot: U32,
        pub ivsel: U32,
        pub config: U32,
        pub lastblock_len: U32,
        pub lastblock: [u8; AES_BLOCK_SIZE],
        pub cmac_reg: [u8; AES_BLOCK_SIZE],
        pub dst: U64,
        pub src: SeAddr,
        pub key_length: U32,
        pub _rsvd: [u8; 52],
    }

    #[repr(C)]
    #[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
    pub struct ShaArgs {
        /// Only the two low words are populated.
        pub msg_total_length: [U32; 4],
        pub msg_left_length: [U32; 4],
        pub hash: [u8; SHA_MAX_DIGEST_SIZE],
        pub dst: U64,
        pub src: SeAddr,
        pub mode: U32,
        pub padding: U32,
    }

    const _: () = assert!(core::mem::size_of::<IvcHeader>() == IVC_HEADER_SIZE);
    const _: () = assert!(core::mem::size_of::<TxEntry>() == TX_ENTRY_SIZE);
    const _: () = assert!(core::mem::size_of::<RxEntry>() == RX_ENTRY_SIZE);
    const _: () = assert!(core::mem::size_of::<IvcTxMsg>() == IVC_MSG_SIZE);
    const _: () = assert!(core::mem::size_of::<IvcRxMsg>() == IVC_MSG_SIZE);

    const _: () = assert!(core::mem::offset_of!(AesOpArgs, src) == 32);
    const _: () = assert!(core::mem::offset_of!(AesOpArgs, key_length) == 48);
    const _: () = assert!(core::mem::offset_of!(CmacArgs, dst) == 48);
    const _: () = assert!(core::mem::offset_of!(CmacArgs, key_length) == 64);
    const _: () = assert!(core::mem::offset_of!(ShaArgs, dst) == 96);
    const _: () = assert!(core::mem::offset_of!(ShaArgs, mode) == 112);

    impl TxEntry {
        pub fn key_iv(&self) -> KeyIvArgs {
            zerocopy::transmute!(self.args)
        }

        pub fn aes_op(&self) -> AesOpArgs {
            zerocopy::transmute!(self.args)
        }

        pub fn cmac_subkey(&self) -> CmacSubkeyArgs {
            zerocopy::transmute!(self.args)
        }

        pub fn cmac(&self) -> CmacArgs {
            zerocopy::transmute!(self.args)
        }

        pub fn sha(&self) -> ShaArgs {
            zerocopy::transmute!(self.args)
        }

        pub fn set_key_iv(&mut self, args: KeyIvArgs) {
            self.args = zerocopy::transmute!(args);
        }

        pub fn set_aes_op(&mut self, args: AesOpArgs) {
            self.args = zerocopy::transmute!(args);
        }

        pub fn set_cmac_subkey(&mut self, args: CmacSubkeyArgs) {
            self.args = zerocopy::transmute!(args);
        }

        pub fn set_cmac(&mut self, args: CmacArgs) {
            self.args = zerocopy::transmute!(args);
        }

        pub fn set_sha(&mut self, args: ShaArgs) {
            self.args = zerocopy::transmute!(args);
        }
    }

    /// Splits a length into the (low, high) words of the engine's length fields.
    pub fn length_words(len: u64) -> [U32; 4] {
        [
            U32::new(len as u32),
            U32::new((len >> 32) as u32),
            U32::ZERO,
            U32::ZERO,
        ]
    }

    pub fn length_from_words(words: &[U32; 4]) -> u64 {
        u64::from(words[0].get()) | (u64::from(words[1].get()) << 32)
    }
}
