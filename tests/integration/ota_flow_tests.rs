//! Signed firmware update over the OTA characteristic, end to end:
//! Start, chunked image, Finish with an ECDSA P-256 signature, then the
//! deferred restart into the new image.

use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey};

use x1bridge::app::commands::Job;
use x1bridge::events::BridgeEvent;
use x1bridge::ota::{OtaError, OtaPhase, IMAGE_FORMAT_RAW};
use x1bridge::power::ShutdownKind;
use x1bridge::protocol::CharId;
use x1bridge::protocol::codec::{OTA_STATUS_FAILURE, OTA_STATUS_SUCCESS, OtaMessage};

use crate::mock_ports::{Bridge, PHONE_CONN};

const CHUNK: usize = 180;

fn signer() -> SigningKey {
    SigningKey::from_slice(&[0x42; 32]).unwrap()
}

fn public_key() -> Vec<u8> {
    signer().verifying_key().to_encoded_point(false).as_bytes().to_vec()
}

fn sign_with(key: &SigningKey, image: &[u8]) -> Vec<u8> {
    let digest = hmac_sha256::Hash::hash(image);
    let sig: Signature = key.sign_prehash(&digest).unwrap();
    sig.to_der().as_bytes().to_vec()
}

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

fn send(bridge: &Bridge, msg: OtaMessage<'_>) {
    bridge.write(CharId::OtaUpdate, &msg.encode());
}

fn upload(bridge: &Bridge, image: &[u8]) {
    send(
        bridge,
        OtaMessage::Start {
            format: IMAGE_FORMAT_RAW,
            size: image.len() as u32,
        },
    );
    for chunk in image.chunks(CHUNK) {
        send(bridge, OtaMessage::Chunk(chunk));
    }
}

fn updating_bridge() -> Bridge {
    let bridge = Bridge::with_ota_key(&public_key());
    bridge.pair_phone(&[CharId::OtaUpdate]);
    bridge
}

fn phase(bridge: &Bridge) -> OtaPhase {
    bridge.runtime.lock().ota().unwrap().phase()
}

// ── Happy path ────────────────────────────────────────────────

#[test]
fn signed_image_is_committed_and_booted() {
    let bridge = updating_bridge();
    let firmware = image(1000);

    upload(&bridge, &firmware);
    assert_eq!(
        phase(&bridge),
        OtaPhase::Receiving {
            expected_size: 1000,
            bytes_written: 1000
        }
    );
    assert!(bridge.take_jobs().is_empty());

    send(&bridge, OtaMessage::Finish {
        signature: &sign_with(&signer(), &firmware),
    });
    assert_eq!(phase(&bridge), OtaPhase::Committed);
    assert_eq!(bridge.firmware.flash().boot, Some(firmware));
    assert_eq!(bridge.notified(CharId::OtaUpdate), [vec![OTA_STATUS_SUCCESS]]);

    assert_eq!(bridge.take_jobs(), [Job::Shutdown(ShutdownKind::Restart)]);
    bridge.runtime.run(Job::Shutdown(ShutdownKind::Restart));
    assert_eq!(bridge.system.restarts(), 1);
}

#[test]
fn committed_update_refuses_a_second_start() {
    let bridge = updating_bridge();
    let firmware = image(64);
    upload(&bridge, &firmware);
    send(&bridge, OtaMessage::Finish {
        signature: &sign_with(&signer(), &firmware),
    });

    send(&bridge, OtaMessage::Start {
        format: IMAGE_FORMAT_RAW,
        size: 64,
    });
    assert_eq!(phase(&bridge), OtaPhase::Committed);
    assert_eq!(
        bridge.notified(CharId::OtaUpdate),
        [vec![OTA_STATUS_SUCCESS], vec![OTA_STATUS_FAILURE]]
    );
}

// ── Rejections ────────────────────────────────────────────────

#[test]
fn foreign_signature_is_rejected() {
    let bridge = updating_bridge();
    let firmware = image(300);
    upload(&bridge, &firmware);

    let intruder = SigningKey::from_slice(&[0x24; 32]).unwrap();
    send(&bridge, OtaMessage::Finish {
        signature: &sign_with(&intruder, &firmware),
    });

    assert!(matches!(phase(&bridge), OtaPhase::Failed(OtaError::Signature(_))));
    let flash = bridge.firmware.flash();
    assert_eq!(flash.boot, None);
    assert_eq!(flash.aborted, 1);
    assert_eq!(bridge.notified(CharId::OtaUpdate), [vec![OTA_STATUS_FAILURE]]);
    assert!(bridge.take_jobs().is_empty());
}

#[test]
fn tampered_image_is_rejected() {
    let bridge = updating_bridge();
    let firmware = image(300);
    let mut tampered = firmware.clone();
    tampered[150] ^= 0x01;
    upload(&bridge, &tampered);

    send(&bridge, OtaMessage::Finish {
        signature: &sign_with(&signer(), &firmware),
    });
    assert_eq!(bridge.firmware.flash().boot, None);
    assert_eq!(bridge.notified(CharId::OtaUpdate), [vec![OTA_STATUS_FAILURE]]);
}

#[test]
fn short_image_is_rejected_at_finish() {
    let bridge = updating_bridge();
    let firmware = image(400);
    send(&bridge, OtaMessage::Start {
        format: IMAGE_FORMAT_RAW,
        size: 400,
    });
    send(&bridge, OtaMessage::Chunk(&firmware[..CHUNK]));
    send(&bridge, OtaMessage::Finish {
        signature: &sign_with(&signer(), &firmware[..CHUNK]),
    });

    assert_eq!(
        phase(&bridge),
        OtaPhase::Failed(OtaError::SizeMismatch {
            expected: 400,
            written: CHUNK as u32
        })
    );
    assert_eq!(bridge.firmware.flash().boot, None);
}

#[test]
fn oversized_chunk_aborts_the_transfer() {
    let bridge = updating_bridge();
    send(&bridge, OtaMessage::Start {
        format: IMAGE_FORMAT_RAW,
        size: 10,
    });
    send(&bridge, OtaMessage::Chunk(&[0; 6]));
    send(&bridge, OtaMessage::Chunk(&[0; 6]));

    assert_eq!(
        phase(&bridge),
        OtaPhase::Failed(OtaError::Overflow {
            expected: 10,
            attempted: 12
        })
    );
    assert_eq!(bridge.firmware.flash().aborted, 1);
    assert_eq!(bridge.notified(CharId::OtaUpdate), [vec![OTA_STATUS_FAILURE]]);
}

#[test]
fn unknown_format_is_rejected() {
    let bridge = updating_bridge();
    send(&bridge, OtaMessage::Start { format: 2, size: 10 });
    assert_eq!(phase(&bridge), OtaPhase::Idle);
    assert_eq!(bridge.notified(CharId::OtaUpdate), [vec![OTA_STATUS_FAILURE]]);
}

#[test]
fn chunk_without_start_is_rejected() {
    let bridge = updating_bridge();
    send(&bridge, OtaMessage::Chunk(&[1, 2, 3]));
    assert_eq!(phase(&bridge), OtaPhase::Idle);
    assert!(bridge.firmware.flash().staged.is_empty());
}

#[test]
fn failed_transfer_can_start_over() {
    let bridge = updating_bridge();
    send(&bridge, OtaMessage::Start {
        format: IMAGE_FORMAT_RAW,
        size: 4,
    });
    send(&bridge, OtaMessage::Chunk(&[0; 8]));

    let firmware = image(32);
    upload(&bridge, &firmware);
    send(&bridge, OtaMessage::Finish {
        signature: &sign_with(&signer(), &firmware),
    });
    assert_eq!(phase(&bridge), OtaPhase::Committed);
    assert_eq!(bridge.firmware.flash().boot, Some(firmware));
}

#[test]
fn disconnect_discards_a_partial_image() {
    let bridge = updating_bridge();
    let firmware = image(500);
    send(&bridge, OtaMessage::Start {
        format: IMAGE_FORMAT_RAW,
        size: 500,
    });
    send(&bridge, OtaMessage::Chunk(&firmware[..CHUNK]));

    bridge.gatt.peer(BridgeEvent::PeerDisconnected { conn_id: PHONE_CONN });
    assert_eq!(phase(&bridge), OtaPhase::Failed(OtaError::Interrupted));
    let flash = bridge.firmware.flash();
    assert_eq!(flash.aborted, 1);
    assert!(flash.staged.is_empty());
}

#[test]
fn refused_partition_fails_the_start() {
    let bridge = updating_bridge();
    bridge.firmware.set_refuse_begin(true);
    send(&bridge, OtaMessage::Start {
        format: IMAGE_FORMAT_RAW,
        size: 100,
    });
    assert_eq!(phase(&bridge), OtaPhase::Idle);
    assert_eq!(bridge.notified(CharId::OtaUpdate), [vec![OTA_STATUS_FAILURE]]);
}

#[test]
fn bridge_without_key_has_no_update_path() {
    let bridge = Bridge::new();
    bridge.pair_phone(&[CharId::OtaUpdate]);
    assert!(!bridge.runtime.lock().ota_available());
    send(&bridge, OtaMessage::Start {
        format: IMAGE_FORMAT_RAW,
        size: 10,
    });
    assert!(bridge.notified(CharId::OtaUpdate).is_empty());
    assert!(bridge.runtime.lock().ota().is_none());
}
