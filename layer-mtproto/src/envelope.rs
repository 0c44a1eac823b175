//! Service-message envelope parsing.
//!
//! A decrypted server message is flattened into a list of [`Incoming`]
//! items: containers are expanded, `gzip_packed` is inflated, and RPC
//! results are paired with the `req_msg_id` they answer.

use std::io::Read;

use layer_tl_types::deserialize::{Error, Result};
use layer_tl_types::{Cursor, Deserializable};

use crate::tl::ids;

/// One logical item received from the server.
#[derive(Clone, Debug, PartialEq)]
pub enum Incoming {
    /// Successful result body for `req_msg_id` (already unpacked).
    RpcResult { req_msg_id: i64, body: Vec<u8> },
    /// `rpc_error` answering `req_msg_id`.
    RpcError { req_msg_id: i64, code: i32, message: String },
    /// Our salt was wrong; resend `bad_msg_id` with `new_salt`.
    BadServerSalt { bad_msg_id: i64, new_salt: i64 },
    /// `bad_msg_notification` for `bad_msg_id`.
    BadMsg { bad_msg_id: i64, code: i32 },
    NewSession { first_msg_id: i64, server_salt: i64 },
    Ack { msg_ids: Vec<i64> },
    Pong { msg_id: i64, ping_id: i64 },
    /// Anything else (updates and so on), passed through untouched.
    Other { body: Vec<u8> },
}

/// A parsed item together with the id/seqno of the message carrying it.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub msg_id: i64,
    pub seq_no: i32,
    pub item:   Incoming,
}

impl Envelope {
    /// Odd sequence numbers are content-related and must be acknowledged.
    pub fn needs_ack(&self) -> bool { self.seq_no & 1 == 1 }
}

/// Flatten one message body into envelopes.
pub fn parse(msg_id: i64, seq_no: i32, body: &[u8]) -> Result<Vec<Envelope>> {
    let mut out = Vec::new();
    parse_into(msg_id, seq_no, body, &mut out)?;
    Ok(out)
}

fn parse_into(msg_id: i64, seq_no: i32, body: &[u8], out: &mut Vec<Envelope>) -> Result<()> {
    let mut cur = Cursor::from_slice(body);
    let push = |out: &mut Vec<Envelope>, item| out.push(Envelope { msg_id, seq_no, item });

    match cur.peek_id()? {
        ids::MSG_CONTAINER => {
            u32::deserialize(&mut cur)?;
            let count = i32::deserialize(&mut cur)?.max(0);
            for _ in 0..count {
                let inner_id  = i64::deserialize(&mut cur)?;
                let inner_seq = i32::deserialize(&mut cur)?;
                let len       = u32::deserialize(&mut cur)? as usize;
                let inner     = cur.take(len)?;
                parse_into(inner_id, inner_seq, inner, out)?;
            }
        }
        ids::GZIP_PACKED => {
            u32::deserialize(&mut cur)?;
            let packed = Vec::<u8>::deserialize(&mut cur)?;
            parse_into(msg_id, seq_no, &inflate(&packed)?, out)?;
        }
        ids::RPC_RESULT => {
            u32::deserialize(&mut cur)?;
            let req_msg_id = i64::deserialize(&mut cur)?;
            let item = match cur.peek_id()? {
                ids::RPC_ERROR => {
                    u32::deserialize(&mut cur)?;
                    let code = i32::deserialize(&mut cur)?;
                    let message = String::deserialize(&mut cur)?;
                    Incoming::RpcError { req_msg_id, code, message }
                }
                ids::GZIP_PACKED => {
                    u32::deserialize(&mut cur)?;
                    let packed = Vec::<u8>::deserialize(&mut cur)?;
                    Incoming::RpcResult { req_msg_id, body: inflate(&packed)? }
                }
                _ => {
                    let mut rest = Vec::new();
                    cur.read_to_end(&mut rest);
                    Incoming::RpcResult { req_msg_id, body: rest }
                }
            };
            push(out, item);
        }
        ids::BAD_SERVER_SALT => {
            u32::deserialize(&mut cur)?;
            let bad_msg_id = i64::deserialize(&mut cur)?;
            let _bad_seqno = i32::deserialize(&mut cur)?;
            let _code      = i32::deserialize(&mut cur)?;
            let new_salt   = i64::deserialize(&mut cur)?;
            push(out, Incoming::BadServerSalt { bad_msg_id, new_salt });
        }
        ids::BAD_MSG_NOTIFICATION => {
            u32::deserialize(&mut cur)?;
            let bad_msg_id = i64::deserialize(&mut cur)?;
            let _bad_seqno = i32::deserialize(&mut cur)?;
            let code       = i32::deserialize(&mut cur)?;
            push(out, Incoming::BadMsg { bad_msg_id, code });
        }
        ids::NEW_SESSION_CREATED => {
            u32::deserialize(&mut cur)?;
            let first_msg_id = i64::deserialize(&mut cur)?;
            let _unique_id   = i64::deserialize(&mut cur)?;
            let server_salt  = i64::deserialize(&mut cur)?;
            push(out, Incoming::NewSession { first_msg_id, server_salt });
        }
        ids::MSGS_ACK => {
            u32::deserialize(&mut cur)?;
            let msg_ids = Vec::<i64>::deserialize(&mut cur)?;
            push(out, Incoming::Ack { msg_ids });
        }
        ids::PONG => {
            u32::deserialize(&mut cur)?;
            let msg_id  = i64::deserialize(&mut cur)?;
            let ping_id = i64::deserialize(&mut cur)?;
            push(out, Incoming::Pong { msg_id, ping_id });
        }
        _ => push(out, Incoming::Other { body: body.to_vec() }),
    }
    Ok(())
}

fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    if flate2::read::GzDecoder::new(data).read_to_end(&mut out).is_ok() && !out.is_empty() {
        return Ok(out);
    }
    out.clear();
    flate2::read::ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|_| Error::UnexpectedValue { expected: "compressed payload", field: "packed_data".into() })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use layer_tl_types::Serializable;

    fn rpc_result(req: i64, payload: &[u8]) -> Vec<u8> {
        let mut b = ids::RPC_RESULT.to_le_bytes().to_vec();
        b.extend(req.to_le_bytes());
        b.extend_from_slice(payload);
        b
    }

    #[test]
    fn container_members_keep_their_ids() {
        let first = rpc_result(10, &true.to_bytes());
        let mut ack = ids::MSGS_ACK.to_le_bytes().to_vec();
        vec![10i64].serialize(&mut ack);

        let mut body = ids::MSG_CONTAINER.to_le_bytes().to_vec();
        body.extend(2i32.to_le_bytes());
        for (id, seq, inner) in [(101i64, 1i32, &first), (102, 2, &ack)] {
            body.extend(id.to_le_bytes());
            body.extend(seq.to_le_bytes());
            body.extend((inner.len() as u32).to_le_bytes());
            body.extend_from_slice(inner);
        }

        let parsed = parse(100, 0, &body).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].msg_id, 101);
        assert!(parsed[0].needs_ack());
        assert_eq!(parsed[0].item, Incoming::RpcResult { req_msg_id: 10, body: true.to_bytes() });
        assert_eq!(parsed[1].item, Incoming::Ack { msg_ids: vec![10] });
        assert!(!parsed[1].needs_ack());
    }

    #[test]
    fn rpc_error_is_split_out() {
        let mut err = ids::RPC_ERROR.to_le_bytes().to_vec();
        420i32.serialize(&mut err);
        "FLOOD_WAIT_3".serialize(&mut err);
        let parsed = parse(1, 1, &rpc_result(55, &err)).unwrap();
        assert_eq!(
            parsed[0].item,
            Incoming::RpcError { req_msg_id: 55, code: 420, message: "FLOOD_WAIT_3".into() }
        );
    }

    #[test]
    fn gzip_result_is_inflated() {
        use std::io::Write;
        let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b"payload!").unwrap();
        let packed = enc.finish().unwrap();

        let mut gz = ids::GZIP_PACKED.to_le_bytes().to_vec();
        packed.serialize(&mut gz);
        let parsed = parse(1, 1, &rpc_result(7, &gz)).unwrap();
        assert_eq!(parsed[0].item, Incoming::RpcResult { req_msg_id: 7, body: b"payload!".to_vec() });
    }

    #[test]
    fn bad_salt_carries_new_salt() {
        let mut b = ids::BAD_SERVER_SALT.to_le_bytes().to_vec();
        b.extend(9i64.to_le_bytes());
        b.extend(1i32.to_le_bytes());
        b.extend(48i32.to_le_bytes());
        b.extend(1234i64.to_le_bytes());
        let parsed = parse(2, 2, &b).unwrap();
        assert_eq!(parsed[0].item, Incoming::BadServerSalt { bad_msg_id: 9, new_salt: 1234 });
    }
}
