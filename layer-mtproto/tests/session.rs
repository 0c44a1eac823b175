use layer_mtproto::transport::{Decoder, FrameError, TransportKind};
use layer_mtproto::encrypted::DecryptError;
use layer_mtproto::{EncryptedSession, Message, MessageId, Session};
use layer_crypto::{AuthKey, Side, encrypt_data_v2_as};

#[test]
fn msg_ids_increase_and_stay_aligned() {
    let mut s = Session::new();
    let mut last = 0i64;
    for _ in 0..1000 {
        let id = s.next_msg_id().0;
        assert!(id > last, "msg_id must increase");
        assert_eq!(id % 4, 0, "client msg_id must be divisible by four");
        last = id;
    }
}

#[test]
fn seq_no_parity() {
    let mut s = Session::new();
    assert_eq!(s.next_seq_no(false), 0);
    assert_eq!(s.next_seq_no(true), 1);
    assert_eq!(s.next_seq_no(true), 3);
    assert_eq!(s.next_seq_no(false), 4);
}

#[test]
fn reset_changes_session_id() {
    let mut s = Session::with_id(1);
    s.next_seq_no(true);
    s.reset();
    assert_ne!(s.session_id(), 1);
    assert_eq!(s.next_seq_no(true), 1);
}

#[test]
fn plaintext_roundtrip_through_wire_layout() {
    let msg = Message::plaintext(MessageId(0x1234_5678_0000_0004), 0, vec![0xAA, 0xBB, 0xCC, 0xDD]);
    let wire = msg.to_plaintext_bytes();
    assert_eq!(wire.len(), 8 + 8 + 4 + 4);
    assert_eq!(&wire[..8], &[0u8; 8]);

    let back = Message::from_plaintext_bytes(&wire).unwrap();
    assert_eq!(back.id, msg.id);
    assert_eq!(back.body, msg.body);
    assert!(Message::from_plaintext_bytes(&wire[..10]).is_none());
}

#[test]
fn container_body_lists_members() {
    let a = Message { id: MessageId(8), seq_no: 1, body: vec![1, 2, 3, 4] };
    let b = Message { id: MessageId(12), seq_no: 3, body: vec![5, 6, 7, 8] };
    let body = Message::container_body(&[a, b]);
    assert_eq!(&body[..4], &0x73f1f8dcu32.to_le_bytes());
    assert_eq!(&body[4..8], &2u32.to_le_bytes());
    assert_eq!(body.len(), 8 + 2 * (16 + 4));
}

fn varied_key() -> AuthKey {
    let mut data = [0u8; 256];
    for (i, b) in data.iter_mut().enumerate() { *b = i as u8; }
    AuthKey::from_bytes(data)
}

/// Inner plaintext of a server message: salt, session, msg_id, seq_no, body.
fn server_frame(key: &AuthKey, session_id: i64, body: &[u8]) -> Vec<u8> {
    let mut plain = Vec::new();
    plain.extend(7i64.to_le_bytes());
    plain.extend(session_id.to_le_bytes());
    plain.extend(13i64.to_le_bytes());
    plain.extend(1i32.to_le_bytes());
    plain.extend((body.len() as u32).to_le_bytes());
    plain.extend_from_slice(body);
    encrypt_data_v2_as(&plain, key, Side::Server)
}

#[test]
fn own_frames_do_not_decrypt_as_server_frames() {
    let session = EncryptedSession::new(varied_key(), 99);
    let mut frame = session.encrypt(1, 4, 1, &[0u8; 8]);
    assert_eq!(&frame[..8], &session.auth_key().key_id());
    assert!(matches!(session.decrypt(&mut frame, 1), Err(DecryptError::Crypto(_))));
}

#[test]
fn server_frame_for_another_session_is_rejected() {
    let key = varied_key();
    let session = EncryptedSession::new(key.clone(), 99);

    let mut frame = server_frame(&key, 1, &[9u8; 8]);
    let msg = session.decrypt(&mut frame, 1).unwrap();
    assert_eq!((msg.salt, msg.msg_id, msg.seq_no), (7, 13, 1));
    assert_eq!(msg.body, vec![9u8; 8]);

    let mut frame = server_frame(&key, 1, &[9u8; 8]);
    assert!(matches!(session.decrypt(&mut frame, 2), Err(DecryptError::SessionMismatch)));
}

// ── Framing ───────────────────────────────────────────────────────────────────

#[test]
fn abridged_frame_and_decode() {
    let kind = TransportKind::Abridged;
    assert_eq!(kind.init_bytes(), &[0xef]);

    let small = kind.frame(&[1u8; 8]);
    assert_eq!(small[0], 2);

    let big_payload = vec![7u8; 127 * 4];
    let big = kind.frame(&big_payload);
    assert_eq!(&big[..4], &[0x7f, 127, 0, 0]);

    let mut dec = Decoder::new(kind);
    dec.push(&small[..3]);
    assert_eq!(dec.next_frame(), Ok(None));
    dec.push(&small[3..]);
    dec.push(&big);
    assert_eq!(dec.next_frame(), Ok(Some(vec![1u8; 8])));
    assert_eq!(dec.next_frame(), Ok(Some(big_payload)));
    assert_eq!(dec.next_frame(), Ok(None));
}

#[test]
fn intermediate_reports_transport_codes() {
    let kind = TransportKind::Intermediate;
    let mut dec = Decoder::new(kind);
    dec.push(&kind.frame(&(-404i32).to_le_bytes()));
    assert_eq!(dec.next_frame(), Err(FrameError::TransportCode(-404)));
}
