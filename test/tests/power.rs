use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use std::sync::Arc;
use vse::aes::NUM_SERVER_REQ;
use vse::error::ENODEV;
use vse::{AesMode, AesSession, CipherRequest, PowerState, ScatterList, ShaAlg};
use vse_test::{run_cipher, wait_until, Events, Rig};

const KEY: [u8; 16] = [0x10; 16];

fn ecb_block(block: [u8; 16]) -> Vec<u8> {
    let mut b = GenericArray::from(block);
    Aes128::new(&GenericArray::from(KEY)).encrypt_block(&mut b);
    b.to_vec()
}

/// Fills the in-flight window with held responses, parks the worker on one
/// more batch and leaves `queued` requests behind it. Ids run from 0.
fn park_worker(rig: &Rig, session: &AesSession, events: &Arc<Events>, queued: usize) {
    let submit = |id: usize| {
        let req = CipherRequest::new(
            ScatterList::from_slice(&[id as u8; 16]),
            None,
            events.callback(id),
        );
        session.encrypt(req).unwrap();
    };
    rig.engine.hold_responses(true);
    for id in 0..NUM_SERVER_REQ {
        submit(id);
        wait_until("batch sent", || rig.engine.held() == id + 1);
    }
    submit(NUM_SERVER_REQ);
    wait_until("worker took the request", || rig.vse.queued_requests() == 0);
    for id in NUM_SERVER_REQ + 1..=NUM_SERVER_REQ + queued {
        submit(id);
    }
    assert_eq!(rig.vse.queued_requests(), queued);
}

/// Lets held responses through once the cipher engine refuses work.
fn release_when_suspended(rig: &Rig) {
    wait_until("suspend started", || rig.vse.aes(AesMode::Ecb).is_err());
    rig.engine.hold_responses(false);
}

#[test]
fn suspended_engines_refuse_every_entry_point() {
    let rig = Rig::new();
    let cipher = rig.cipher(AesMode::Cbc, &KEY);
    let cmac = rig.vse.cmac().unwrap();
    cmac.set_key(&KEY).unwrap();
    let sha = rig.vse.sha(ShaAlg::Sha256).unwrap();

    let mut hash = sha.request();
    hash.init().unwrap();
    hash.update(&ScatterList::from_slice(&[1; 100])).unwrap();
    let mut mac = cmac.request();
    mac.init().unwrap();
    let mut fresh_hash = sha.request();
    let mut fresh_mac = cmac.request();
    let events = Events::new();

    rig.vse.suspend().unwrap();
    assert_eq!(rig.vse.power_state(), PowerState::Suspended);
    let sent = rig.engine.messages().len();

    let enodev = |err: vse::VseError| assert_eq!(err.errno(), -ENODEV);
    let block = || ScatterList::from_slice(&[0; 32]);
    let request = |id| CipherRequest::new(block(), Some([0; 16]), events.callback(id));
    enodev(cipher.encrypt(request(0)).unwrap_err());
    enodev(cipher.decrypt(request(1)).unwrap_err());
    enodev(cipher.set_key(&KEY).unwrap_err());

    enodev(fresh_hash.init().unwrap_err());
    enodev(hash.update(&block()).unwrap_err());
    enodev(fresh_hash.digest(&block()).unwrap_err());
    enodev(hash.init().unwrap_err());
    enodev(hash.finup(&block()).unwrap_err());
    enodev(hash.finalize().unwrap_err());

    enodev(fresh_mac.init().unwrap_err());
    enodev(mac.update(&block()).unwrap_err());
    enodev(mac.finup(&block()).unwrap_err());
    enodev(fresh_mac.digest().unwrap_err());
    enodev(cmac.set_key(&KEY).unwrap_err());

    enodev(rig.vse.aes(AesMode::Ecb).err().unwrap());
    enodev(rig.vse.sha(ShaAlg::Sha1).err().unwrap());
    assert_eq!(rig.engine.messages().len(), sent);
    assert_eq!(events.drain(), 0);

    rig.vse.resume().unwrap();
    assert_eq!(rig.vse.power_state(), PowerState::Running);
    let mut hash = sha.request();
    assert_eq!(hash.digest(&block()).unwrap().len(), 32);
    let done = run_cipher(&cipher, true, &[0; 32], Some([0; 16]));
    assert_eq!(done.errno(), 0);
}

#[test]
fn suspend_finishes_the_batch_in_flight_and_keeps_the_queue() {
    let rig = Rig::new();
    let session = rig.cipher(AesMode::Ecb, &KEY);
    let events = Events::new();
    let queued = 10;
    park_worker(&rig, &session, &events, queued);

    std::thread::scope(|s| {
        s.spawn(|| release_when_suspended(&rig));
        rig.vse.suspend().unwrap();
    });
    assert_eq!(rig.vse.inflight_batches(), 0);
    assert_eq!(rig.vse.queued_requests(), queued);

    // everything sent before the suspend completed normally
    let (done, _) = events.wait_done(NUM_SERVER_REQ + 1);
    for (id, d) in &done {
        assert!(*id <= NUM_SERVER_REQ);
        assert_eq!(d.errno(), 0);
        assert_eq!(d.dst.to_vec(), ecb_block([*id as u8; 16]));
    }
    assert_eq!(events.drain(), 0);

    rig.vse.resume().unwrap();
    let (done, _) = events.wait_done(queued);
    for (id, d) in &done {
        assert!(*id > NUM_SERVER_REQ);
        assert_eq!(d.dst.to_vec(), ecb_block([*id as u8; 16]));
    }
}

#[test]
fn shutdown_fails_queued_requests_and_is_final() {
    let rig = Rig::new();
    let session = rig.cipher(AesMode::Ecb, &KEY);
    let events = Events::new();
    let queued = 5;
    park_worker(&rig, &session, &events, queued);

    std::thread::scope(|s| {
        s.spawn(|| release_when_suspended(&rig));
        rig.vse.shutdown();
    });
    assert_eq!(rig.vse.power_state(), PowerState::Shutdown);

    let (done, _) = events.wait_done(NUM_SERVER_REQ + 1 + queued);
    for (id, d) in &done {
        match *id <= NUM_SERVER_REQ {
            true => assert_eq!(d.errno(), 0),
            false => assert_eq!(d.errno(), -ENODEV),
        }
    }

    assert_eq!(rig.vse.resume().unwrap_err().errno(), -ENODEV);
    assert_eq!(rig.vse.suspend().unwrap_err().errno(), -ENODEV);
    let req = CipherRequest::new(ScatterList::from_slice(&[0; 16]), None, events.callback(99));
    assert_eq!(session.encrypt(req).unwrap_err().errno(), -ENODEV);
    rig.vse.shutdown();
}

#[test]
fn suspend_and_resume_are_idempotent() {
    let rig = Rig::new();
    rig.vse.resume().unwrap();
    rig.vse.suspend().unwrap();
    rig.vse.suspend().unwrap();
    rig.vse.resume().unwrap();
    rig.vse.resume().unwrap();
    assert_eq!(rig.vse.power_state(), PowerState::Running);
    let mut req = rig.vse.sha(ShaAlg::Sha224).unwrap().request();
    assert_eq!(req.digest(&ScatterList::from_slice(b"abc")).unwrap().len(), 28);
}
