//! Session persistence: the key material of every datacenter.

use std::io;
use std::path::Path;

use layer_crypto::AuthKey;

use crate::auth_key::{KeyState, PermAuthKey, PermSlot, TempAuthKey};

const FORMAT_VERSION: u8 = 1;

/// Counterpart of [`write_temp`]. Takes the reader macro of `from_bytes`.
macro_rules! read_temp {
    ($r:ident) => {{
        match $r!(1)[0] {
            0 => None,
            _ => {
                let key = AuthKey::from_bytes($r!(256));
                let salt = i64::from_le_bytes($r!(8));
                let expires_at = i64::from_le_bytes($r!(8));
                let mut temp = TempAuthKey::new(key, salt, expires_at);
                if $r!(1)[0] == 1 {
                    temp.bind(i64::from_le_bytes($r!(8)));
                }
                Some(temp)
            }
        }
    }};
}

/// Keys of one datacenter as they are stored.
#[derive(Clone, Debug, PartialEq)]
pub enum PersistedDc {
    /// A media datacenter reading the permanent key of `linked_dc`.
    Linked { linked_dc: i32, temp: Option<TempAuthKey> },
    Owned  { perm: Option<PermAuthKey>, temp: Option<TempAuthKey> },
}

impl PersistedDc {
    pub(crate) fn from_keys(keys: &KeyState) -> Self {
        match &keys.perm {
            PermSlot::Linked(main) => Self::Linked { linked_dc: *main, temp: keys.temp.clone() },
            PermSlot::Owned(perm)  => Self::Owned { perm: perm.clone(), temp: keys.temp.clone() },
        }
    }

    pub(crate) fn into_keys(self) -> KeyState {
        match self {
            Self::Linked { linked_dc, temp } => KeyState { temp, perm: PermSlot::Linked(linked_dc) },
            Self::Owned { perm, temp }       => KeyState { temp, perm: PermSlot::Owned(perm) },
        }
    }

    pub fn temp(&self) -> Option<&TempAuthKey> {
        match self {
            Self::Linked { temp, .. } | Self::Owned { temp, .. } => temp.as_ref(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DcRecord {
    pub dc_id:  i32,
    pub is_cdn: bool,
    pub keys:   PersistedDc,
}

/// Everything needed to resume without a new handshake.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PersistedSession {
    pub authorized_dc: Option<i32>,
    pub logged_in:     bool,
    pub dcs:           Vec<DcRecord>,
}

impl PersistedSession {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = vec![FORMAT_VERSION];
        match self.authorized_dc {
            Some(dc) => { b.push(1); b.extend_from_slice(&dc.to_le_bytes()); }
            None     => b.push(0),
        }
        b.push(self.logged_in as u8);
        b.extend_from_slice(&(self.dcs.len() as u16).to_le_bytes());
        for d in &self.dcs {
            b.extend_from_slice(&d.dc_id.to_le_bytes());
            b.push(d.is_cdn as u8);
            match &d.keys {
                PersistedDc::Linked { linked_dc, temp } => {
                    b.push(1);
                    b.extend_from_slice(&linked_dc.to_le_bytes());
                    write_temp(&mut b, temp.as_ref());
                }
                PersistedDc::Owned { perm, temp } => {
                    b.push(0);
                    match perm {
                        Some(p) => {
                            b.push(1);
                            b.extend_from_slice(p.key().as_bytes());
                            b.extend_from_slice(&p.salt.to_le_bytes());
                            b.push(p.is_authorized() as u8);
                        }
                        None => b.push(0),
                    }
                    write_temp(&mut b, temp.as_ref());
                }
            }
        }
        b
    }

    pub fn from_bytes(buf: &[u8]) -> io::Result<Self> {
        let mut p = 0usize;
        macro_rules! r {
            ($n:expr) => {{
                if p + $n > buf.len() {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated session"));
                }
                let mut a = [0u8; $n];
                a.copy_from_slice(&buf[p..p + $n]);
                p += $n;
                a
            }};
        }

        let version = r!(1)[0];
        if version != FORMAT_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported session format {version}"),
            ));
        }
        let authorized_dc = match r!(1)[0] {
            0 => None,
            _ => Some(i32::from_le_bytes(r!(4))),
        };
        let logged_in = r!(1)[0] == 1;
        let count = u16::from_le_bytes(r!(2)) as usize;
        let mut dcs = Vec::with_capacity(count);
        for _ in 0..count {
            let dc_id = i32::from_le_bytes(r!(4));
            let is_cdn = r!(1)[0] == 1;
            let linked = r!(1)[0] == 1;
            let keys = if linked {
                let linked_dc = i32::from_le_bytes(r!(4));
                PersistedDc::Linked { linked_dc, temp: read_temp!(r) }
            } else {
                let perm = match r!(1)[0] {
                    0 => None,
                    _ => {
                        let key = AuthKey::from_bytes(r!(256));
                        let salt = i64::from_le_bytes(r!(8));
                        let mut perm = PermAuthKey::new(key, salt);
                        perm.authorized(r!(1)[0] == 1);
                        Some(perm)
                    }
                };
                PersistedDc::Owned { perm, temp: read_temp!(r) }
            };
            dcs.push(DcRecord { dc_id, is_cdn, keys });
        }
        Ok(Self { authorized_dc, logged_in, dcs })
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        std::fs::write(path, self.to_bytes())
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        Self::from_bytes(&std::fs::read(path)?)
    }
}

fn write_temp(b: &mut Vec<u8>, temp: Option<&TempAuthKey>) {
    let Some(t) = temp else {
        b.push(0);
        return;
    };
    b.push(1);
    b.extend_from_slice(t.key().as_bytes());
    b.extend_from_slice(&t.salt.to_le_bytes());
    b.extend_from_slice(&t.expires_at().to_le_bytes());
    match t.bound_to() {
        Some(id) => { b.push(1); b.extend_from_slice(&id.to_le_bytes()); }
        None     => b.push(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PersistedSession {
        let mut perm = PermAuthKey::new(AuthKey::from_bytes([7; 256]), 11);
        perm.authorized(true);
        let mut temp = TempAuthKey::new(AuthKey::from_bytes([8; 256]), 12, 1_700_000_000);
        temp.bind(perm.id());
        PersistedSession {
            authorized_dc: Some(2),
            logged_in:     true,
            dcs: vec![
                DcRecord { dc_id: 2, is_cdn: false, keys: PersistedDc::Owned { perm: Some(perm), temp: Some(temp) } },
                DcRecord { dc_id: -2, is_cdn: false, keys: PersistedDc::Linked { linked_dc: 2, temp: None } },
                DcRecord { dc_id: 203, is_cdn: true, keys: PersistedDc::Owned { perm: None, temp: None } },
            ],
        }
    }

    #[test]
    fn binary_format_keeps_everything() {
        let s = sample();
        assert_eq!(PersistedSession::from_bytes(&s.to_bytes()).unwrap(), s);
        let empty = PersistedSession::default();
        assert_eq!(PersistedSession::from_bytes(&empty.to_bytes()).unwrap(), empty);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let bytes = sample().to_bytes();
        let err = PersistedSession::from_bytes(&bytes[..bytes.len() - 3]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(PersistedSession::from_bytes(&[9]).is_err());
    }

    #[test]
    fn key_state_conversion() {
        let rec = sample().dcs.remove(1);
        let keys = rec.keys.clone().into_keys();
        assert_eq!(keys.perm, PermSlot::Linked(2));
        assert_eq!(PersistedDc::from_keys(&keys), rec.keys);
    }
}
