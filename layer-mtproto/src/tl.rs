//! Hand-written MTProto service constructors.
//!
//! Only the fixed protocol layer lives here: the DH handshake, temp key
//! binding, acknowledgements and call wrappers. API-level calls are
//! [`layer_tl_types::Value`] trees handled by an external codec.

use layer_tl_types::deserialize::{Buffer, Error, Result};
use layer_tl_types::{Deserializable, Identifiable, RemoteCall, Serializable};

// ─── Constructor IDs ─────────────────────────────────────────────────────────

pub mod ids {
    pub const RES_PQ:                  u32 = 0x05162463;
    pub const REQ_PQ_MULTI:            u32 = 0xbe7e8ef1;
    pub const P_Q_INNER_DATA_DC:       u32 = 0xa9f55f95;
    pub const P_Q_INNER_DATA_TEMP_DC:  u32 = 0x56fddf88;
    pub const REQ_DH_PARAMS:           u32 = 0xd712e4be;
    pub const SERVER_DH_PARAMS_FAIL:   u32 = 0x79cb045d;
    pub const SERVER_DH_PARAMS_OK:     u32 = 0xd0e8075c;
    pub const SERVER_DH_INNER_DATA:    u32 = 0xb5890dba;
    pub const CLIENT_DH_INNER_DATA:    u32 = 0x6643b654;
    pub const SET_CLIENT_DH_PARAMS:    u32 = 0xf5045f1f;
    pub const DH_GEN_OK:               u32 = 0x3bcbf734;
    pub const DH_GEN_RETRY:            u32 = 0x46dc1fb9;
    pub const DH_GEN_FAIL:             u32 = 0xa69dae02;
    pub const BIND_AUTH_KEY_INNER:     u32 = 0x75a3f765;
    pub const BIND_TEMP_AUTH_KEY:      u32 = 0xcdd42a05;
    pub const INVOKE_AFTER_MSG:        u32 = 0xcb9f372d;
    pub const MSGS_ACK:                u32 = 0x62d6b459;
    pub const RPC_RESULT:              u32 = 0xf35c6d01;
    pub const RPC_ERROR:               u32 = 0x2144ca19;
    pub const MSG_CONTAINER:           u32 = 0x73f1f8dc;
    pub const GZIP_PACKED:             u32 = 0x3072cfa1;
    pub const PONG:                    u32 = 0x347773c5;
    pub const BAD_SERVER_SALT:         u32 = 0xedab447b;
    pub const BAD_MSG_NOTIFICATION:    u32 = 0xa7eff811;
    pub const NEW_SESSION_CREATED:     u32 = 0x9ec20908;
}

fn expect_id(buf: Buffer, id: u32) -> Result<()> {
    match u32::deserialize(buf)? {
        got if got == id => Ok(()),
        got => Err(Error::UnexpectedConstructor { id: got }),
    }
}

// ─── req_pq_multi ────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct ReqPqMulti {
    pub nonce: [u8; 16],
}

impl Identifiable for ReqPqMulti { const CONSTRUCTOR_ID: u32 = ids::REQ_PQ_MULTI; }

impl Serializable for ReqPqMulti {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.nonce.serialize(buf);
    }
}

impl RemoteCall for ReqPqMulti { type Return = ResPq; }

#[derive(Clone, Debug, PartialEq)]
pub struct ResPq {
    pub nonce:                          [u8; 16],
    pub server_nonce:                   [u8; 16],
    pub pq:                             Vec<u8>,
    pub server_public_key_fingerprints: Vec<i64>,
}

impl Identifiable for ResPq { const CONSTRUCTOR_ID: u32 = ids::RES_PQ; }

impl Serializable for ResPq {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.nonce.serialize(buf);
        self.server_nonce.serialize(buf);
        self.pq.serialize(buf);
        self.server_public_key_fingerprints.serialize(buf);
    }
}

impl Deserializable for ResPq {
    fn deserialize(buf: Buffer) -> Result<Self> {
        expect_id(buf, Self::CONSTRUCTOR_ID)?;
        Ok(Self {
            nonce:                          <[u8; 16]>::deserialize(buf)?,
            server_nonce:                   <[u8; 16]>::deserialize(buf)?,
            pq:                             Vec::<u8>::deserialize(buf)?,
            server_public_key_fingerprints: Vec::<i64>::deserialize(buf)?,
        })
    }
}

// ─── p_q_inner_data ──────────────────────────────────────────────────────────

/// `p_q_inner_data_dc` for permanent keys, `p_q_inner_data_temp_dc` when
/// `expires_in` is set.
#[derive(Clone, Debug, PartialEq)]
pub struct PqInnerData {
    pub pq:           Vec<u8>,
    pub p:            Vec<u8>,
    pub q:            Vec<u8>,
    pub nonce:        [u8; 16],
    pub server_nonce: [u8; 16],
    pub new_nonce:    [u8; 32],
    pub dc:           i32,
    pub expires_in:   Option<i32>,
}

impl Serializable for PqInnerData {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        let id = if self.expires_in.is_some() { ids::P_Q_INNER_DATA_TEMP_DC } else { ids::P_Q_INNER_DATA_DC };
        id.serialize(buf);
        self.pq.serialize(buf);
        self.p.serialize(buf);
        self.q.serialize(buf);
        self.nonce.serialize(buf);
        self.server_nonce.serialize(buf);
        self.new_nonce.serialize(buf);
        self.dc.serialize(buf);
        self.expires_in.serialize(buf);
    }
}

// ─── req_DH_params ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct ReqDhParams {
    pub nonce:                  [u8; 16],
    pub server_nonce:           [u8; 16],
    pub p:                      Vec<u8>,
    pub q:                      Vec<u8>,
    pub public_key_fingerprint: i64,
    pub encrypted_data:         Vec<u8>,
}

impl Identifiable for ReqDhParams { const CONSTRUCTOR_ID: u32 = ids::REQ_DH_PARAMS; }

impl Serializable for ReqDhParams {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.nonce.serialize(buf);
        self.server_nonce.serialize(buf);
        self.p.serialize(buf);
        self.q.serialize(buf);
        self.public_key_fingerprint.serialize(buf);
        self.encrypted_data.serialize(buf);
    }
}

impl RemoteCall for ReqDhParams { type Return = ServerDhParams; }

#[derive(Clone, Debug, PartialEq)]
pub enum ServerDhParams {
    Fail { nonce: [u8; 16], server_nonce: [u8; 16], new_nonce_hash: [u8; 16] },
    Ok   { nonce: [u8; 16], server_nonce: [u8; 16], encrypted_answer: Vec<u8> },
}

impl Serializable for ServerDhParams {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        match self {
            Self::Fail { nonce, server_nonce, new_nonce_hash } => {
                ids::SERVER_DH_PARAMS_FAIL.serialize(buf);
                nonce.serialize(buf);
                server_nonce.serialize(buf);
                new_nonce_hash.serialize(buf);
            }
            Self::Ok { nonce, server_nonce, encrypted_answer } => {
                ids::SERVER_DH_PARAMS_OK.serialize(buf);
                nonce.serialize(buf);
                server_nonce.serialize(buf);
                encrypted_answer.serialize(buf);
            }
        }
    }
}

impl Deserializable for ServerDhParams {
    fn deserialize(buf: Buffer) -> Result<Self> {
        match u32::deserialize(buf)? {
            ids::SERVER_DH_PARAMS_FAIL => Ok(Self::Fail {
                nonce:          <[u8; 16]>::deserialize(buf)?,
                server_nonce:   <[u8; 16]>::deserialize(buf)?,
                new_nonce_hash: <[u8; 16]>::deserialize(buf)?,
            }),
            ids::SERVER_DH_PARAMS_OK => Ok(Self::Ok {
                nonce:            <[u8; 16]>::deserialize(buf)?,
                server_nonce:     <[u8; 16]>::deserialize(buf)?,
                encrypted_answer: Vec::<u8>::deserialize(buf)?,
            }),
            id => Err(Error::UnexpectedConstructor { id }),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServerDhInnerData {
    pub nonce:        [u8; 16],
    pub server_nonce: [u8; 16],
    pub g:            i32,
    pub dh_prime:     Vec<u8>,
    pub g_a:          Vec<u8>,
    pub server_time:  i32,
}

impl Identifiable for ServerDhInnerData { const CONSTRUCTOR_ID: u32 = ids::SERVER_DH_INNER_DATA; }

impl Serializable for ServerDhInnerData {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.nonce.serialize(buf);
        self.server_nonce.serialize(buf);
        self.g.serialize(buf);
        self.dh_prime.serialize(buf);
        self.g_a.serialize(buf);
        self.server_time.serialize(buf);
    }
}

impl Deserializable for ServerDhInnerData {
    fn deserialize(buf: Buffer) -> Result<Self> {
        expect_id(buf, Self::CONSTRUCTOR_ID)?;
        Ok(Self {
            nonce:        <[u8; 16]>::deserialize(buf)?,
            server_nonce: <[u8; 16]>::deserialize(buf)?,
            g:            i32::deserialize(buf)?,
            dh_prime:     Vec::<u8>::deserialize(buf)?,
            g_a:          Vec::<u8>::deserialize(buf)?,
            server_time:  i32::deserialize(buf)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClientDhInnerData {
    pub nonce:        [u8; 16],
    pub server_nonce: [u8; 16],
    pub retry_id:     i64,
    pub g_b:          Vec<u8>,
}

impl Identifiable for ClientDhInnerData { const CONSTRUCTOR_ID: u32 = ids::CLIENT_DH_INNER_DATA; }

impl Serializable for ClientDhInnerData {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.nonce.serialize(buf);
        self.server_nonce.serialize(buf);
        self.retry_id.serialize(buf);
        self.g_b.serialize(buf);
    }
}

// ─── set_client_DH_params ────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct SetClientDhParams {
    pub nonce:          [u8; 16],
    pub server_nonce:   [u8; 16],
    pub encrypted_data: Vec<u8>,
}

impl Identifiable for SetClientDhParams { const CONSTRUCTOR_ID: u32 = ids::SET_CLIENT_DH_PARAMS; }

impl Serializable for SetClientDhParams {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.nonce.serialize(buf);
        self.server_nonce.serialize(buf);
        self.encrypted_data.serialize(buf);
    }
}

impl RemoteCall for SetClientDhParams { type Return = SetClientDhParamsAnswer; }

/// `dh_gen_ok` / `dh_gen_retry` / `dh_gen_fail`.
#[derive(Clone, Debug, PartialEq)]
pub struct SetClientDhParamsAnswer {
    /// 1 for ok, 2 for retry, 3 for fail.
    pub kind:           u8,
    pub nonce:          [u8; 16],
    pub server_nonce:   [u8; 16],
    pub new_nonce_hash: [u8; 16],
}

impl Serializable for SetClientDhParamsAnswer {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        let id = match self.kind {
            1 => ids::DH_GEN_OK,
            2 => ids::DH_GEN_RETRY,
            _ => ids::DH_GEN_FAIL,
        };
        id.serialize(buf);
        self.nonce.serialize(buf);
        self.server_nonce.serialize(buf);
        self.new_nonce_hash.serialize(buf);
    }
}

impl Deserializable for SetClientDhParamsAnswer {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let kind = match u32::deserialize(buf)? {
            ids::DH_GEN_OK    => 1,
            ids::DH_GEN_RETRY => 2,
            ids::DH_GEN_FAIL  => 3,
            id => return Err(Error::UnexpectedConstructor { id }),
        };
        Ok(Self {
            kind,
            nonce:          <[u8; 16]>::deserialize(buf)?,
            server_nonce:   <[u8; 16]>::deserialize(buf)?,
            new_nonce_hash: <[u8; 16]>::deserialize(buf)?,
        })
    }
}

// ─── Temp key binding ────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct BindAuthKeyInner {
    pub nonce:            i64,
    pub temp_auth_key_id: i64,
    pub perm_auth_key_id: i64,
    pub temp_session_id:  i64,
    pub expires_at:       i32,
}

impl Identifiable for BindAuthKeyInner { const CONSTRUCTOR_ID: u32 = ids::BIND_AUTH_KEY_INNER; }

impl Serializable for BindAuthKeyInner {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.nonce.serialize(buf);
        self.temp_auth_key_id.serialize(buf);
        self.perm_auth_key_id.serialize(buf);
        self.temp_session_id.serialize(buf);
        self.expires_at.serialize(buf);
    }
}

/// `auth.bindTempAuthKey`. Answered with a boxed `Bool`.
#[derive(Clone, Debug, PartialEq)]
pub struct BindTempAuthKey {
    pub perm_auth_key_id:  i64,
    pub nonce:             i64,
    pub expires_at:        i32,
    pub encrypted_message: Vec<u8>,
}

impl Identifiable for BindTempAuthKey { const CONSTRUCTOR_ID: u32 = ids::BIND_TEMP_AUTH_KEY; }

impl Serializable for BindTempAuthKey {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.perm_auth_key_id.serialize(buf);
        self.nonce.serialize(buf);
        self.expires_at.serialize(buf);
        self.encrypted_message.serialize(buf);
    }
}

impl RemoteCall for BindTempAuthKey { type Return = bool; }

// ─── Wrappers and service messages ───────────────────────────────────────────

/// `invokeAfterMsg`: run `query` only after `msg_id` has been processed.
/// `query` is an already serialized call and is written without a prefix.
#[derive(Clone, Debug, PartialEq)]
pub struct InvokeAfterMsg {
    pub msg_id: i64,
    pub query:  Vec<u8>,
}

impl Identifiable for InvokeAfterMsg { const CONSTRUCTOR_ID: u32 = ids::INVOKE_AFTER_MSG; }

impl Serializable for InvokeAfterMsg {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.msg_id.serialize(buf);
        buf.extend(self.query.iter().copied());
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MsgsAck {
    pub msg_ids: Vec<i64>,
}

impl Identifiable for MsgsAck { const CONSTRUCTOR_ID: u32 = ids::MSGS_ACK; }

impl Serializable for MsgsAck {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        Self::CONSTRUCTOR_ID.serialize(buf);
        self.msg_ids.serialize(buf);
    }
}
