//! Per-datacenter key objects.

use layer_crypto::AuthKey;

/// Long-lived key owned by one datacenter.
#[derive(Clone, Debug, PartialEq)]
pub struct PermAuthKey {
    key:        AuthKey,
    pub salt:   i64,
    authorized: bool,
}

impl PermAuthKey {
    pub fn new(key: AuthKey, salt: i64) -> Self {
        Self { key, salt, authorized: false }
    }

    pub fn key(&self) -> &AuthKey { &self.key }
    pub fn id(&self) -> i64 { self.key.id() }
    pub fn is_authorized(&self) -> bool { self.authorized }
    pub fn authorized(&mut self, authorized: bool) { self.authorized = authorized; }
}

/// Rotating key that carries traffic once bound.
///
/// Login state lives on the permanent key: a temporary key counts as
/// authorized once it is bound to an authorized permanent key.
#[derive(Clone, Debug, PartialEq)]
pub struct TempAuthKey {
    key:        AuthKey,
    pub salt:   i64,
    /// Id of the permanent key this one is bound to.
    bound_to:   Option<i64>,
    /// Unix time; zero for a key aliasing the permanent one.
    expires_at: i64,
}

impl TempAuthKey {
    pub fn new(key: AuthKey, salt: i64, expires_at: i64) -> Self {
        Self { key, salt, bound_to: None, expires_at }
    }

    /// Without forward secrecy the "temporary" key is the permanent key.
    pub fn from_perm(perm: &PermAuthKey) -> Self {
        Self {
            key:        perm.key.clone(),
            salt:       perm.salt,
            bound_to:   Some(perm.id()),
            expires_at: 0,
        }
    }

    pub fn key(&self) -> &AuthKey { &self.key }
    pub fn id(&self) -> i64 { self.key.id() }
    pub fn expires_at(&self) -> i64 { self.expires_at }

    pub fn bind(&mut self, perm_id: i64) { self.bound_to = Some(perm_id); }
    pub fn unbind(&mut self) { self.bound_to = None; }
    pub fn is_bound(&self) -> bool { self.bound_to.is_some() }
    pub fn bound_to(&self) -> Option<i64> { self.bound_to }
}

/// The permanent-key slot of a datacenter.
///
/// Media datacenters do not own a key; they name the datacenter whose key
/// they read.
#[derive(Clone, Debug, PartialEq)]
pub enum PermSlot {
    Owned(Option<PermAuthKey>),
    Linked(i32),
}

impl Default for PermSlot {
    fn default() -> Self { Self::Owned(None) }
}

/// Authorization progress of one datacenter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthState {
    Unbound,
    TempKeyGenerated,
    Bound,
    Authorized,
}

/// Key material held by a datacenter.
#[derive(Clone, Debug, Default)]
pub(crate) struct KeyState {
    pub(crate) temp: Option<TempAuthKey>,
    pub(crate) perm: PermSlot,
}

impl KeyState {
    /// `perm_authorized` is the flag of the permanent key in effect, which
    /// for a media datacenter is the linked one.
    pub(crate) fn state(&self, is_cdn: bool, perm_authorized: bool) -> AuthState {
        match &self.temp {
            None                              => AuthState::Unbound,
            Some(_) if is_cdn                 => AuthState::Bound,
            Some(t) if !t.is_bound()          => AuthState::TempKeyGenerated,
            Some(_) if perm_authorized        => AuthState::Authorized,
            Some(_)                           => AuthState::Bound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> AuthKey { AuthKey::from_bytes([b; 256]) }

    #[test]
    fn state_progression() {
        let mut ks = KeyState::default();
        assert_eq!(ks.state(false, false), AuthState::Unbound);

        ks.temp = Some(TempAuthKey::new(key(1), 7, 100));
        assert_eq!(ks.state(false, true), AuthState::TempKeyGenerated);
        assert_eq!(ks.state(true, false), AuthState::Bound);

        let perm = PermAuthKey::new(key(2), 0);
        ks.temp.as_mut().unwrap().bind(perm.id());
        assert_eq!(ks.state(false, false), AuthState::Bound);
        assert_eq!(ks.state(false, true), AuthState::Authorized);

        ks.temp.as_mut().unwrap().unbind();
        assert_eq!(ks.state(false, true), AuthState::TempKeyGenerated);
    }

    #[test]
    fn no_pfs_temp_aliases_perm() {
        let perm = PermAuthKey::new(key(3), 99);
        let temp = TempAuthKey::from_perm(&perm);
        assert_eq!(temp.id(), perm.id());
        assert_eq!(temp.salt, 99);
        assert!(temp.is_bound());
    }
}
