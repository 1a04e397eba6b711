use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use common::ivc::{
    Engine, CMD_AES_ALLOC_KEY, CMD_AES_RELEASE_KEY, CMD_AES_SET_KEY, KEYSLOT_COUNT,
};
use vse::error::{EINVAL, EPERM, EREMOTEIO};
use vse::{AesMode, LoggedMsg};
use vse_test::{all_nodes, run_cipher, Rig};

const PROVISIONED: [u8; 16] = [0x3c; 16];

fn count(msgs: &[LoggedMsg], cmd: u32) -> usize {
    msgs.iter().filter(|m| m.cmds().contains(&cmd)).count()
}

fn ecb_block(key: &[u8; 16], block: [u8; 16]) -> [u8; 16] {
    let mut b = GenericArray::from(block);
    Aes128::new(&GenericArray::from(*key)).encrypt_block(&mut b);
    b.into()
}

#[test]
fn label_binds_the_provisioned_slot() {
    let rig = Rig::new();
    rig.engine.provision_label_slot(7, &PROVISIONED);

    let session = rig.vse.aes(AesMode::Ecb).unwrap();
    session.set_key(b"NVSEAES 7\0").unwrap();
    assert_eq!(session.keyslot(), Some(7));

    let done = run_cipher(&session, true, &[0x11; 16], None);
    assert_eq!(done.dst.to_vec(), ecb_block(&PROVISIONED, [0x11; 16]));
    drop(session);

    let msgs = rig.engine.messages();
    assert_eq!(count(&msgs, CMD_AES_ALLOC_KEY), 0);
    assert_eq!(count(&msgs, CMD_AES_RELEASE_KEY), 0);
    assert_eq!(count(&msgs, CMD_AES_SET_KEY), 1);
    let set_key = msgs[0].entries[0].key_iv();
    assert_eq!(set_key.slot.get(), 7);
    assert!(rig.engine.allocated_slots().is_empty());
}

#[test]
fn out_of_range_labels_never_reach_the_engine() {
    let rig = Rig::new();
    let session = rig.vse.aes(AesMode::Cbc).unwrap();
    for label in [&b"NVSEAES 16\0"[..], b"NVSEAES -1\0"] {
        assert_eq!(session.set_key(label).unwrap_err().errno(), -EINVAL);
    }
    let cmac = rig.vse.cmac().unwrap();
    assert_eq!(cmac.set_key(b"NVSEAES 16\0").unwrap_err().errno(), -EINVAL);

    assert!(rig.engine.messages().is_empty());
    assert_eq!(session.keyslot(), None);
}

#[test]
fn labels_for_unprovisioned_slots_are_refused_by_the_engine() {
    let rig = Rig::new();
    let session = rig.vse.aes(AesMode::Ecb).unwrap();
    assert_eq!(session.set_key(b"NVSEAES 3\0").unwrap_err().errno(), -EPERM);
}

#[test]
fn disabled_labels_are_plain_key_material() {
    let nodes = all_nodes()
        .into_iter()
        .map(|node| node.with_flag("disable-keyslot-label"))
        .collect();
    let rig = Rig::build(nodes, |b| b).unwrap();
    rig.engine.provision_label_slot(7, &PROVISIONED);

    let session = rig.vse.aes(AesMode::Ecb).unwrap();
    // ten bytes is no AES key size
    assert_eq!(session.set_key(b"NVSEAES 7\0").unwrap_err().errno(), -EINVAL);
    assert!(rig.engine.messages().is_empty());

    session.set_key(&[0x42; 16]).unwrap();
    assert_ne!(session.keyslot(), Some(7));
}

#[test]
fn sessions_give_their_slots_back() {
    let rig = Rig::new();
    let sessions: Vec<_> = (0..3)
        .map(|i| rig.cipher(AesMode::ALL[i], &[i as u8; 32]))
        .collect();
    let cmac = rig.vse.cmac().unwrap();
    cmac.set_key(&[9; 16]).unwrap();

    let mut slots: Vec<_> = sessions.iter().filter_map(|s| s.keyslot()).collect();
    slots.extend(cmac.keyslot());
    slots.sort_unstable();
    assert_eq!(rig.engine.allocated_slots(), slots);

    // rekeying reuses the slot
    sessions[0].set_key(&[0xee; 16]).unwrap();
    assert_eq!(count(&rig.engine.messages(), CMD_AES_ALLOC_KEY), 4);

    drop(sessions);
    drop(cmac);
    assert!(rig.engine.allocated_slots().is_empty());
    assert_eq!(count(&rig.engine.messages(), CMD_AES_RELEASE_KEY), 4);
}

#[test]
fn switching_to_a_label_releases_the_owned_slot() {
    let rig = Rig::new();
    rig.engine.provision_label_slot(5, &PROVISIONED);
    let session = rig.cipher(AesMode::Ecb, &[1; 16]);
    let owned = session.keyslot().unwrap();
    assert_eq!(rig.engine.allocated_slots(), vec![owned]);

    session.set_key(b"NVSEAES 5\0").unwrap();
    assert_eq!(session.keyslot(), Some(5));
    assert!(rig.engine.allocated_slots().is_empty());

    let done = run_cipher(&session, true, &[0; 16], None);
    assert_eq!(done.dst.to_vec(), ecb_block(&PROVISIONED, [0; 16]));
}

#[test]
fn exhausted_key_table_reports_an_engine_error() {
    let rig = Rig::new();
    let sessions: Vec<_> = (0..KEYSLOT_COUNT)
        .map(|_| rig.cipher(AesMode::Ctr, &[7; 24]))
        .collect();
    assert_eq!(rig.engine.allocated_slots().len(), KEYSLOT_COUNT as usize);

    let extra = rig.vse.aes(AesMode::Ctr).unwrap();
    assert_eq!(extra.set_key(&[7; 24]).unwrap_err().errno(), -EREMOTEIO);
    assert_eq!(extra.keyslot(), None);

    drop(sessions);
    extra.set_key(&[7; 24]).unwrap();
    let msgs = rig.engine.messages();
    assert!(msgs.iter().all(|m| m.engine == Engine::Aes1.id()));
}
