use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit, StreamCipher};
use common::ivc::{
    Engine, CMD_AES_DECRYPT, CMD_AES_ENCRYPT, MAX_BUFFER_SIZE, MAX_TASKS_PER_SUBMIT,
};
use hex_literal::hex;
use vse::aes::{CRYPTO_QUEUE_LEN, NUM_SERVER_REQ};
use vse::error::{EBUSY, EINPROGRESS, EINVAL, ENOSPC};
use vse::{AesMode, CipherRequest, Enqueued, LoggedMsg, ScatterList};
use vse_test::{pattern, run_cipher, wait_until, Events, Rig};

const KEYS: [&[u8]; 3] = [&[0x2b; 16], &[0x8e; 24], &[0x60; 32]];
const IV: [u8; 16] = hex!("000102030405060708090a0b0c0d0e0f");

macro_rules! by_key_len {
    ($key:expr, $f:ident, $($arg:expr),*) => {
        match $key.len() {
            16 => $f::<Aes128>($key, $($arg),*),
            24 => $f::<Aes192>($key, $($arg),*),
            32 => $f::<Aes256>($key, $($arg),*),
            len => panic!("no AES-{}", len * 8),
        }
    };
}

fn cbc_ref<C>(key: &[u8], iv: &[u8; 16], data: &[u8], encrypt: bool) -> Vec<u8>
where
    C: aes::cipher::BlockCipher
        + aes::cipher::BlockEncrypt
        + aes::cipher::BlockDecrypt
        + KeyInit,
{
    match encrypt {
        true => cbc::Encryptor::<C>::new_from_slices(key, iv)
            .unwrap()
            .encrypt_padded_vec_mut::<NoPadding>(data),
        false => cbc::Decryptor::<C>::new_from_slices(key, iv)
            .unwrap()
            .decrypt_padded_vec_mut::<NoPadding>(data)
            .unwrap(),
    }
}

fn ecb_ref<C>(key: &[u8], data: &[u8], encrypt: bool) -> Vec<u8>
where
    C: aes::cipher::BlockCipher
        + aes::cipher::BlockEncrypt
        + aes::cipher::BlockDecrypt
        + KeyInit,
{
    match encrypt {
        true => ecb::Encryptor::<C>::new_from_slice(key)
            .unwrap()
            .encrypt_padded_vec_mut::<NoPadding>(data),
        false => ecb::Decryptor::<C>::new_from_slice(key)
            .unwrap()
            .decrypt_padded_vec_mut::<NoPadding>(data)
            .unwrap(),
    }
}

fn ctr_ref<C>(key: &[u8], iv: &[u8; 16], data: &[u8]) -> Vec<u8>
where
    C: aes::cipher::BlockCipher
        + aes::cipher::BlockEncrypt
        + aes::cipher::BlockSizeUser<BlockSize = aes::cipher::consts::U16>
        + KeyInit,
{
    let mut out = data.to_vec();
    ctr::Ctr128BE::<C>::new_from_slices(key, iv)
        .unwrap()
        .apply_keystream(&mut out);
    out
}

fn reference(mode: AesMode, key: &[u8], iv: &[u8; 16], data: &[u8], encrypt: bool) -> Vec<u8> {
    match mode {
        AesMode::Cbc => by_key_len!(key, cbc_ref, iv, data, encrypt),
        AesMode::Ecb => by_key_len!(key, ecb_ref, data, encrypt),
        AesMode::Ctr => by_key_len!(key, ctr_ref, iv, data),
    }
}

fn crypt_messages(msgs: &[LoggedMsg]) -> Vec<&LoggedMsg> {
    msgs.iter()
        .filter(|m| {
            m.cmds()
                .first()
                .is_some_and(|&c| c == CMD_AES_ENCRYPT || c == CMD_AES_DECRYPT)
        })
        .collect()
}

#[test]
fn every_mode_and_key_size_matches_the_reference() {
    let rig = Rig::new();
    for mode in AesMode::ALL {
        for key in KEYS {
            let session = rig.cipher(mode, key);
            let iv = (mode != AesMode::Ecb).then_some(IV);
            for len in [16, 48, 4096] {
                let plain = pattern(len, len as u8);
                let enc = run_cipher(&session, true, &plain, iv);
                enc.result.unwrap();
                let expected = reference(mode, key, &IV, &plain, true);
                assert_eq!(enc.dst.to_vec(), expected, "{} key {}", mode.name(), key.len());

                let dec = run_cipher(&session, false, &expected, iv);
                dec.result.unwrap();
                assert_eq!(dec.dst.to_vec(), plain);
            }
        }
    }
}

#[test]
fn cbc_encryption_returns_the_chaining_iv() {
    let rig = Rig::new();
    let key = KEYS[0];
    let session = rig.cipher(AesMode::Cbc, key);
    let plain = pattern(128, 1);
    let whole = reference(AesMode::Cbc, key, &IV, &plain, true);

    let first = run_cipher(&session, true, &plain[..64], Some(IV));
    let next_iv = first.iv.unwrap();
    assert_eq!(next_iv[..], whole[48..64]);

    let second = run_cipher(&session, true, &plain[64..], Some(next_iv));
    let mut chained = first.dst.to_vec();
    chained.extend(second.dst.to_vec());
    assert_eq!(chained, whole);
}

#[test]
fn segmented_buffers_are_gathered_and_scattered() {
    let rig = Rig::new();
    let key = KEYS[2];
    let session = rig.cipher(AesMode::Ctr, key);
    let plain = pattern(1000 - 1000 % 16, 4);
    let events = Events::new();
    let src = ScatterList::chunked(&plain, 37);
    let req = CipherRequest::new(src, Some(IV), events.callback(0));
    assert_eq!(session.encrypt(req), Ok(Enqueued::InProgress));
    let (done, _) = events.wait_done(1);
    let done = &done[&0];
    assert_eq!(done.dst.nents(), done.src.nents());
    assert_eq!(done.dst.to_vec(), reference(AesMode::Ctr, key, &IV, &plain, true));
}

#[test]
fn malformed_requests_are_refused_up_front() {
    let rig = Rig::new();
    let events = Events::new();
    let session = rig.vse.aes(AesMode::Ecb).unwrap();

    let req = CipherRequest::new(ScatterList::from_slice(&[0; 32]), None, events.callback(0));
    assert_eq!(session.encrypt(req).unwrap_err().errno(), -EINVAL);

    session.set_key(KEYS[0]).unwrap();
    let req = CipherRequest::new(ScatterList::from_slice(&[0; 15]), None, events.callback(1));
    assert_eq!(session.encrypt(req).unwrap_err().errno(), -EINVAL);
    let req = CipherRequest::new(ScatterList::new(), None, events.callback(2));
    assert_eq!(session.decrypt(req).unwrap_err().errno(), -EINVAL);

    assert_eq!(session.set_key(&[0; 20]).unwrap_err().errno(), -EINVAL);
    assert!(crypt_messages(&rig.engine.messages()).is_empty());
    assert_eq!(events.drain(), 0);
}

#[test]
fn queued_requests_share_one_message_per_batch() {
    let rig = Rig::new();
    let key = KEYS[1];
    let session = rig.cipher(AesMode::Cbc, key);
    let events = Events::new();

    // park the worker behind a full set of batches in flight
    rig.engine.hold_responses(true);
    let mut plain = Vec::new();
    for id in 0..NUM_SERVER_REQ {
        plain.push(pattern(16 * (id + 1), id as u8));
        let req =
            CipherRequest::new(ScatterList::from_slice(&plain[id]), Some(IV), events.callback(id));
        assert_eq!(session.encrypt(req), Ok(Enqueued::InProgress));
        wait_until("batch sent", || rig.engine.held() == id + 1);
    }
    assert_eq!(rig.vse.inflight_batches(), NUM_SERVER_REQ);

    let blocked = NUM_SERVER_REQ;
    plain.push(pattern(32, 99));
    let req = CipherRequest::new(
        ScatterList::from_slice(&plain[blocked]),
        Some(IV),
        events.callback(blocked),
    );
    session.encrypt(req).unwrap();
    wait_until("worker took the request", || rig.vse.queued_requests() == 0);

    let extra = MAX_TASKS_PER_SUBMIT + 6;
    for id in blocked + 1..=blocked + extra {
        plain.push(pattern(16 * (1 + id % 5), id as u8));
        let req =
            CipherRequest::new(ScatterList::from_slice(&plain[id]), Some(IV), events.callback(id));
        session.encrypt(req).unwrap();
    }
    assert_eq!(rig.vse.queued_requests(), extra);
    assert_eq!(rig.engine.held(), NUM_SERVER_REQ);
    assert_eq!(rig.vse.inflight_batches(), NUM_SERVER_REQ);

    rig.engine.hold_responses(false);
    let (done, promoted) = events.wait_done(plain.len());
    assert!(promoted.is_empty());
    for (id, d) in &done {
        d.result.unwrap();
        assert_eq!(d.dst.to_vec(), reference(AesMode::Cbc, key, &IV, &plain[*id], true));
    }

    let msgs = rig.engine.messages();
    let batches = crypt_messages(&msgs);
    let sizes: Vec<u32> = batches.iter().map(|m| m.num_reqs).collect();
    assert_eq!(sizes, vec![1, 1, 1, 1, 1, MAX_TASKS_PER_SUBMIT as u32, 6]);
    for batch in batches {
        assert_eq!(batch.engine, Engine::Aes1.id());
        assert_eq!(batch.entries.len(), batch.num_reqs as usize);
        // requests sit back to back in one gather buffer
        let args: Vec<_> = batch.entries.iter().map(|e| e.aes_op()).collect();
        let mut next = args[0].src.lo.get();
        for a in &args {
            assert_eq!(a.src.lo.get(), next);
            assert_eq!(a.dst.lo.get(), a.src.lo.get());
            next += a.src.hi.get();
        }
    }
    wait_until("batches retired", || rig.vse.inflight_batches() == 0);
}

#[test]
fn batches_never_gather_more_than_one_buffer() {
    let rig = Rig::new();
    let key = KEYS[0];
    let session = rig.cipher(AesMode::Ecb, key);
    let events = Events::new();
    let submit = |id: usize, data: &[u8]| {
        let req = CipherRequest::new(ScatterList::from_slice(data), None, events.callback(id));
        session.encrypt(req)
    };

    let oversized = vec![0; MAX_BUFFER_SIZE + 16];
    assert_eq!(submit(100, &oversized).unwrap_err().errno(), -EINVAL);
    drop(oversized);

    rig.engine.hold_responses(true);
    for id in 0..NUM_SERVER_REQ {
        submit(id, &[id as u8; 16]).unwrap();
        wait_until("batch sent", || rig.engine.held() == id + 1);
    }
    submit(NUM_SERVER_REQ, &[0; 16]).unwrap();
    wait_until("worker took the request", || rig.vse.queued_requests() == 0);

    // two of these do not fit one gather buffer
    let large = 9 << 20;
    let first = NUM_SERVER_REQ + 1;
    let inputs = [pattern(large, 1), pattern(large, 2), pattern(32, 3)];
    for (k, data) in inputs.iter().enumerate() {
        submit(first + k, data).unwrap();
    }
    assert_eq!(rig.vse.queued_requests(), inputs.len());
    rig.engine.hold_responses(false);

    let (done, _) = events.wait_done(first + inputs.len());
    for (k, data) in inputs.iter().enumerate() {
        let out = done[&(first + k)].dst.to_vec();
        assert_eq!(out.len(), data.len());
        let tail = data.len() - 16;
        assert_eq!(out[..16], reference(AesMode::Ecb, key, &IV, &data[..16], true));
        assert_eq!(out[tail..], reference(AesMode::Ecb, key, &IV, &data[tail..], true));
    }

    let msgs = rig.engine.messages();
    let batches = crypt_messages(&msgs);
    let sizes: Vec<u32> = batches.iter().map(|m| m.num_reqs).collect();
    assert_eq!(sizes, vec![1, 1, 1, 1, 1, 1, 2]);
    for batch in batches {
        let gather: usize = batch.entries.iter().map(|e| e.aes_op().src.hi.get() as usize).sum();
        assert!(gather <= MAX_BUFFER_SIZE, "gather of {gather} bytes");
    }
    wait_until("batches retired", || rig.vse.inflight_batches() == 0);
}

#[test]
fn full_queue_refuses_or_backlogs() {
    let rig = Rig::new();
    let session = rig.cipher(AesMode::Ecb, KEYS[0]);
    let events = Events::new();
    let block = [0x5a; 16];
    let submit = |id: usize, backlog: bool| {
        let mut req = CipherRequest::new(ScatterList::from_slice(&block), None, events.callback(id));
        if backlog {
            req = req.with_backlog();
        }
        session.encrypt(req)
    };

    rig.engine.hold_responses(true);
    for id in 0..NUM_SERVER_REQ {
        submit(id, false).unwrap();
        wait_until("batch sent", || rig.engine.held() == id + 1);
    }
    submit(NUM_SERVER_REQ, false).unwrap();
    wait_until("worker took the request", || rig.vse.queued_requests() == 0);

    let first_queued = NUM_SERVER_REQ + 1;
    for id in first_queued..first_queued + CRYPTO_QUEUE_LEN {
        assert_eq!(submit(id, false), Ok(Enqueued::InProgress));
    }
    let refused = submit(999, false).unwrap_err();
    assert_eq!(refused.errno(), -ENOSPC);

    let backlogged = first_queued + CRYPTO_QUEUE_LEN;
    let status = submit(backlogged, true).unwrap();
    assert_eq!(status, Enqueued::Backlogged);
    assert_eq!(status.errno(), -EBUSY);
    assert_eq!(Enqueued::InProgress.errno(), -EINPROGRESS);

    rig.engine.hold_responses(false);
    let (done, promoted) = events.wait_done(backlogged + 1);
    assert_eq!(promoted, vec![backlogged]);
    assert!(!done.contains_key(&999));
    let expected = reference(AesMode::Ecb, KEYS[0], &IV, &block, true);
    for d in done.values() {
        assert_eq!(d.errno(), 0);
        assert_eq!(d.dst.to_vec(), expected);
    }
}
