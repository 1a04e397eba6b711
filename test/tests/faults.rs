use std::time::Duration;

use common::ivc::{
    CMD_AES_ALLOC_KEY, CMD_AES_CMAC, CMD_AES_ENCRYPT, CMD_SHA_HASH, STATUS_INVALID_ARGS,
    STATUS_INVALID_CMD, STATUS_INVALID_KEY, STATUS_OK, STATUS_OP_ERROR,
};
use sha2::{Digest, Sha256};
use vse::error::{EINVAL, EIO, ENOMEM, EPERM, EREMOTEIO, ETIMEDOUT};
use vse::{AesMode, ScatterList, ShaAlg, Timeouts};
use vse_test::{pattern, run_cipher, test_timeouts, Rig};

fn short_completion() -> Timeouts {
    Timeouts {
        completion: Duration::from_millis(200),
        ..test_timeouts()
    }
}

#[test]
fn batched_requests_complete_with_the_mapped_status() {
    let rig = Rig::new();
    let session = rig.cipher(AesMode::Ecb, &[3; 16]);
    let cases = [
        (STATUS_OK, 0),
        (STATUS_INVALID_CMD, -EPERM),
        (STATUS_OP_ERROR, -EREMOTEIO),
        (STATUS_INVALID_ARGS, -EINVAL),
        (STATUS_INVALID_KEY, -EPERM),
        (0x55, -EIO),
    ];
    for (status, errno) in cases {
        rig.engine.force_status(CMD_AES_ENCRYPT, status);
        let done = run_cipher(&session, true, &[0; 16], None);
        assert_eq!(done.errno(), errno, "status {status}");
    }
    rig.engine.clear_forced_status();
    assert_eq!(run_cipher(&session, true, &[0; 16], None).errno(), 0);
}

#[test]
fn synchronous_commands_return_the_mapped_status() {
    let rig = Rig::new();
    rig.engine.force_status(CMD_SHA_HASH, STATUS_INVALID_ARGS);
    let mut req = rig.vse.sha(ShaAlg::Sha256).unwrap().request();
    let err = req.digest(&ScatterList::from_slice(b"abc")).unwrap_err();
    assert_eq!(err.errno(), -EINVAL);

    rig.engine.force_status(CMD_AES_ALLOC_KEY, STATUS_OP_ERROR);
    let session = rig.vse.aes(AesMode::Cbc).unwrap();
    assert_eq!(session.set_key(&[1; 16]).unwrap_err().errno(), -EREMOTEIO);

    rig.engine.clear_forced_status();
    let cmac = rig.vse.cmac().unwrap();
    cmac.set_key(&[1; 16]).unwrap();
    rig.engine.force_status(CMD_AES_CMAC, STATUS_INVALID_KEY);
    let mut mac = cmac.request();
    mac.init().unwrap();
    let err = mac.finup(&ScatterList::from_slice(&[0; 16])).unwrap_err();
    assert_eq!(err.errno(), -EPERM);
}

#[test]
fn failed_hash_step_is_reported_and_reinit_recovers() {
    let rig = Rig::new();
    let data = pattern(300, 6);
    let mut req = rig.vse.sha(ShaAlg::Sha256).unwrap().request();
    req.init().unwrap();
    req.update(&ScatterList::from_slice(&data[..100])).unwrap();

    rig.engine.force_status(CMD_SHA_HASH, STATUS_OP_ERROR);
    assert!(req.update(&ScatterList::from_slice(&data[100..])).is_err());
    rig.engine.clear_forced_status();

    req.init().unwrap();
    req.update(&ScatterList::from_slice(&data)).unwrap();
    assert_eq!(req.finalize().unwrap(), Sha256::digest(&data).to_vec());
}

#[test]
fn lost_response_times_out_and_frees_its_record() {
    let rig = Rig::with(|b| b.timeouts(short_completion()));
    let mut req = rig.vse.sha(ShaAlg::Sha1).unwrap().request();
    req.digest(&ScatterList::from_slice(b"first")).unwrap();

    rig.engine.drop_responses(1);
    let err = req.digest(&ScatterList::from_slice(b"second")).unwrap_err();
    assert_eq!(err.errno(), -ETIMEDOUT);
    assert_eq!(rig.vse.outstanding(), 0);

    // a duplicate of an earlier response matches nothing
    assert!(rig.engine.replay_last());
    let digest = req.digest(&ScatterList::from_slice(b"third")).unwrap();
    assert_eq!(digest, sha1::Sha1::digest(b"third").to_vec());
}

#[test]
fn late_response_after_timeout_is_discarded() {
    let rig = Rig::with(|b| b.timeouts(short_completion()));
    let mut req = rig.vse.sha(ShaAlg::Sha256).unwrap().request();

    rig.engine.hold_responses(true);
    let err = req.digest(&ScatterList::from_slice(b"late")).unwrap_err();
    assert_eq!(err.errno(), -ETIMEDOUT);
    assert_eq!(rig.engine.held(), 1);
    assert_eq!(rig.engine.release_held(), 1);
    rig.engine.hold_responses(false);

    let digest = req.digest(&ScatterList::from_slice(b"fresh")).unwrap();
    assert_eq!(digest, Sha256::digest(b"fresh").to_vec());
    assert_eq!(rig.vse.outstanding(), 0);
}

#[test]
fn channel_in_reset_fails_sends() {
    let rig = Rig::new();
    rig.engine.set_established(false);
    let mut req = rig.vse.sha(ShaAlg::Sha384).unwrap().request();
    let err = req.digest(&ScatterList::from_slice(b"abc")).unwrap_err();
    assert_eq!(err.errno(), -EIO);
    assert_eq!(rig.vse.outstanding(), 0);
    assert!(rig.engine.messages().is_empty());

    rig.engine.set_established(true);
    let digest = req.digest(&ScatterList::from_slice(b"abc")).unwrap();
    assert_eq!(digest, sha2::Sha384::digest(b"abc").to_vec());
}

#[test]
fn dma_exhaustion_is_reported_and_nothing_leaks() {
    let rig = Rig::new();
    let session = rig.cipher(AesMode::Ctr, &[4; 32]);
    let baseline = rig.dma.mapped_regions();

    rig.dma.inject_alloc_failures(1);
    let mut req = rig.vse.sha(ShaAlg::Sha512).unwrap().request();
    assert_eq!(req.init().unwrap_err().errno(), -ENOMEM);

    rig.dma.inject_alloc_failures(1);
    let done = run_cipher(&session, true, &[0; 64], Some([0; 16]));
    assert_eq!(done.errno(), -ENOMEM);

    let cmac = rig.vse.cmac().unwrap();
    cmac.set_key(&[5; 16]).unwrap();
    let mut mac = cmac.request();
    rig.dma.inject_alloc_failures(1);
    assert_eq!(mac.init().unwrap_err().errno(), -ENOMEM);
    drop(mac);
    drop(cmac);

    assert_eq!(rig.dma.mapped_regions(), baseline);
    assert_eq!(run_cipher(&session, true, &[0; 64], Some([0; 16])).errno(), 0);
}
