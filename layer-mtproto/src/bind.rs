//! Temporary key binding (`auth.bindTempAuthKey`).
//!
//! The inner `bind_auth_key_inner` object is wrapped in an MTProto 1.0
//! envelope and encrypted with the *permanent* key. The outer call is then
//! sent over the temporary key with an explicit message id that must match
//! the one inside the envelope.

use layer_crypto::{AuthKey, encrypt_data_v1};
use layer_tl_types::Serializable;

use crate::tl::{BindAuthKeyInner, BindTempAuthKey};

/// Build the `auth.bindTempAuthKey` request.
///
/// `msg_id` is the id the outer message will be sent with.
pub fn bind_temp_auth_key(
    perm_key:        &AuthKey,
    temp_key:        &AuthKey,
    temp_session_id: i64,
    msg_id:          i64,
    expires_at:      i32,
) -> BindTempAuthKey {
    let mut rnd = [0u8; 8 + 16 + 16];
    getrandom::getrandom(&mut rnd).expect("getrandom");
    do_bind_temp_auth_key(perm_key, temp_key, temp_session_id, msg_id, expires_at, &rnd)
}

fn do_bind_temp_auth_key(
    perm_key:        &AuthKey,
    temp_key:        &AuthKey,
    temp_session_id: i64,
    msg_id:          i64,
    expires_at:      i32,
    random:          &[u8; 40],
) -> BindTempAuthKey {
    let mut nonce_bytes = [0u8; 8];
    nonce_bytes.copy_from_slice(&random[..8]);
    let nonce = i64::from_le_bytes(nonce_bytes);

    let inner = BindAuthKeyInner {
        nonce,
        temp_auth_key_id: temp_key.id(),
        perm_auth_key_id: perm_key.id(),
        temp_session_id,
        expires_at,
    }.to_bytes();

    // random salt + session id, msg_id, seqno 0, length, body
    let mut data = Vec::with_capacity(32 + inner.len());
    data.extend_from_slice(&random[8..24]);
    data.extend(msg_id.to_le_bytes());
    data.extend(0i32.to_le_bytes());
    data.extend((inner.len() as u32).to_le_bytes());
    data.extend_from_slice(&inner);

    let encrypted_message = encrypt_data_v1(&data, perm_key, &random[24..]);

    BindTempAuthKey {
        perm_auth_key_id: perm_key.id(),
        nonce,
        expires_at,
        encrypted_message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use layer_crypto::sha1;

    #[test]
    fn envelope_is_keyed_by_perm_key() {
        let perm = AuthKey::from_bytes([1u8; 256]);
        let temp = AuthKey::from_bytes([2u8; 256]);
        let req = do_bind_temp_auth_key(&perm, &temp, 77, 0x1000, 1_700_000_000, &[3u8; 40]);

        assert_eq!(req.perm_auth_key_id, perm.id());
        assert_eq!(req.nonce, i64::from_le_bytes([3u8; 8]));
        assert_eq!(&req.encrypted_message[..8], &perm.key_id());
        assert_eq!((req.encrypted_message.len() - 24) % 16, 0);
    }

    #[test]
    fn msg_key_covers_unpadded_envelope() {
        let perm = AuthKey::from_bytes([1u8; 256]);
        let temp = AuthKey::from_bytes([2u8; 256]);
        let rnd = [9u8; 40];
        let req = do_bind_temp_auth_key(&perm, &temp, 5, 44, 60, &rnd);

        let inner = BindAuthKeyInner {
            nonce: req.nonce,
            temp_auth_key_id: temp.id(),
            perm_auth_key_id: perm.id(),
            temp_session_id: 5,
            expires_at: 60,
        }.to_bytes();
        let mut data = rnd[8..24].to_vec();
        data.extend(44i64.to_le_bytes());
        data.extend(0i32.to_le_bytes());
        data.extend((inner.len() as u32).to_le_bytes());
        data.extend(inner);

        let hash = sha1!(&data);
        assert_eq!(&req.encrypted_message[8..24], &hash[4..]);
    }
}
