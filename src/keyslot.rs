/*
 * Hardware keyslot management shared by the block-cipher and CMAC paths.
 *
 * Key material may name a pre-provisioned slot instead of carrying a key:
 * "NVSEAES <n>" followed by a NUL inside the key length binds the session
 * to slot n. Such slots are never allocated or released by the session.
 */
use common::ivc::{
    KeyIvArgs, AES_IV_SIZE, AES_MAX_KEY_SIZE, CMD_AES_ALLOC_KEY, CMD_AES_RELEASE_KEY,
    CMD_AES_SET_KEY, KEYSLOT_COUNT, KEYSLOT_LABEL, KEYTBL_TYPE_KEY, KEYTBL_TYPE_OIV,
    KEYTBL_TYPE_UIV,
};
use tracing::{debug, error};
use zerocopy::FromZeros;

use crate::device::SeDevice;
use crate::error::{check_status, VseError};
use crate::pending::OpKind;

/// Which key table entries a set-key request writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyType(u32);

impl KeyType {
    pub const KEY: KeyType = KeyType(KEYTBL_TYPE_KEY);
    pub const OIV: KeyType = KeyType(KEYTBL_TYPE_OIV);
    pub const UIV: KeyType = KeyType(KEYTBL_TYPE_UIV);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: KeyType) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for KeyType {
    type Output = KeyType;

    fn bitor(self, rhs: KeyType) -> KeyType {
        KeyType(self.0 | rhs.0)
    }
}

/// A session's hold on a keyslot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct KeyslotState {
    pub slot: u32,
    pub keylen: u32,
    pub allocated: bool,
    pub is_label: bool,
}

impl KeyslotState {
    /// Whether dropping the session must release the slot.
    pub fn owns_slot(&self) -> bool {
        self.allocated && !self.is_label
    }
}

fn is_c_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | 0x0b | 0x0c | b'\r')
}

/// Parses a keyslot label. `None` when `key` is ordinary key material,
/// `Some(Err)` when it is a label naming a slot out of range.
pub fn parse_keyslot_label(key: &[u8]) -> Option<Result<u32, VseError>> {
    let nul = key.iter().position(|&b| b == 0)?;
    let text = &key[..nul];

    let mut rest = text;
    let skip = |s: &[u8]| -> usize { s.iter().take_while(|&&b| is_c_space(b)).count() };

    rest = &rest[skip(rest)..];
    let token_len = rest.iter().take_while(|&&b| !is_c_space(b)).count();
    if token_len == 0 || &rest[..token_len] != KEYSLOT_LABEL.as_bytes() {
        return None;
    }
    rest = &rest[token_len..];
    rest = &rest[skip(rest)..];

    let (negative, digits) = match rest.first() {
        Some(b'-') => (true, &rest[1..]),
        Some(b'+') => (false, &rest[1..]),
        _ => (false, rest),
    };
    let ndigits = digits.iter().take_while(|b| b.is_ascii_digit()).count();
    if ndigits == 0 {
        return None;
    }

    let mut value: i64 = 0;
    for &d in &digits[..ndigits] {
        value = value.saturating_mul(10).saturating_add(i64::from(d - b'0'));
    }
    if negative {
        value = -value;
    }

    if !(0..i64::from(KEYSLOT_COUNT)).contains(&value) {
        error!(slot = value, "invalid keyslot label");
        return Some(Err(VseError::InvalidKeyslot(value)));
    }
    Some(Ok(value as u32))
}

/// Validates ordinary key material.
pub(crate) fn check_key_len(key: &[u8]) -> Result<(), VseError> {
    match key.len() {
        16 | 24 | 32 => Ok(()),
        len => {
            error!(len, "unsupported AES key length");
            Err(VseError::InvalidArgument)
        }
    }
}

pub(crate) fn alloc_keyslot(dev: &SeDevice) -> Result<u32, VseError> {
    let mut msg = dev.request(CMD_AES_ALLOC_KEY)?;
    let result = dev.submit_sync(&mut msg, OpKind::KeySlot)?;
    check_status(result.status).inspect_err(|err| {
        error!(engine = dev.engine.id(), %err, "keyslot allocation refused");
    })?;
    debug!(engine = dev.engine.id(), slot = result.keyslot, "keyslot allocated");
    Ok(u32::from(result.keyslot))
}

/// Pushes key or IV material into `slot`. Key bytes are `data[..keylen]`;
/// IVs are the first 16 bytes of `data`.
pub(crate) fn set_keyiv(
    dev: &SeDevice,
    data: &[u8],
    keylen: u32,
    slot: u32,
    ty: KeyType,
) -> Result<(), VseError> {
    let mut args = KeyIvArgs::new_zeroed();
    args.slot.set(slot);
    args.key_type.set(ty.bits());

    if ty.contains(KeyType::KEY) {
        let len = keylen as usize;
        crate::ensure!(len <= AES_MAX_KEY_SIZE && len <= data.len())?;
        args.length.set(keylen);
        args.data[..len].copy_from_slice(&data[..len]);
    }
    if ty.contains(KeyType::OIV) || ty.contains(KeyType::UIV) {
        crate::ensure!(data.len() >= AES_IV_SIZE)?;
    }
    if ty.contains(KeyType::OIV) {
        args.oiv.copy_from_slice(&data[..AES_IV_SIZE]);
    }
    if ty.contains(KeyType::UIV) {
        args.uiv.copy_from_slice(&data[..AES_IV_SIZE]);
    }

    let mut msg = dev.request(CMD_AES_SET_KEY)?;
    msg.tx[0].set_key_iv(args);
    let result = dev.submit_sync(&mut msg, OpKind::Process)?;
    check_status(result.status).inspect_err(|err| {
        error!(engine = dev.engine.id(), slot, %err, "set key failed");
    })
}

pub(crate) fn release_keyslot(dev: &SeDevice, slot: u32) -> Result<(), VseError> {
    let mut args = KeyIvArgs::new_zeroed();
    args.slot.set(slot);
    let mut msg = dev.request(CMD_AES_RELEASE_KEY)?;
    msg.tx[0].set_key_iv(args);
    let result = dev.submit_sync(&mut msg, OpKind::Process)?;
    check_status(result.status)?;
    debug!(engine = dev.engine.id(), slot, "keyslot released");
    Ok(())
}

/// Session teardown: gives back a dynamically allocated slot.
pub(crate) fn release_owned(dev: &SeDevice, state: &mut KeyslotState) {
    if !state.owns_slot() {
        return;
    }
    if let Err(err) = release_keyslot(dev, state.slot) {
        error!(engine = dev.engine.id(), slot = state.slot, %err, "keyslot release failed");
    }
    state.allocated = false;
}
