//! Trust-domain scoped JWT signing key stores.
//!
//! Keys are addressed by the pair (trust domain, key id). A key id is only
//! meaningful inside its trust domain, so a lookup never falls through to
//! another domain's keys even when the id matches.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use trustbind_core::{ConfigCell, TrustDomain};

use crate::error::{JwtSvidError, Result};
use crate::key::JwtPublicKey;

/// Source of JWT-SVID verification keys.
pub trait KeyStore: Send + Sync {
    /// Public key registered under `kid` for `trust_domain`.
    fn find_public_key(&self, trust_domain: &TrustDomain, kid: &str) -> Result<Arc<JwtPublicKey>>;
}

/// Immutable two-level map: trust domain -> key id -> public key.
#[derive(Debug, Clone, Default)]
pub struct TrustDomainKeyStore {
    keys: HashMap<TrustDomain, HashMap<String, Arc<JwtPublicKey>>>,
}

impl TrustDomainKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key` under (`trust_domain`, `kid`), replacing any previous
    /// key with the same id in that domain.
    pub fn insert(&mut self, trust_domain: TrustDomain, kid: impl Into<String>, key: JwtPublicKey) {
        self.keys
            .entry(trust_domain)
            .or_default()
            .insert(kid.into(), Arc::new(key));
    }

    pub fn with_key(mut self, trust_domain: TrustDomain, kid: impl Into<String>, key: JwtPublicKey) -> Self {
        self.insert(trust_domain, kid, key);
        self
    }

    pub fn trust_domains(&self) -> impl Iterator<Item = &TrustDomain> {
        self.keys.keys()
    }

    /// Total number of keys across all trust domains.
    pub fn len(&self) -> usize {
        self.keys.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyStore for TrustDomainKeyStore {
    fn find_public_key(&self, trust_domain: &TrustDomain, kid: &str) -> Result<Arc<JwtPublicKey>> {
        let key = self
            .keys
            .get(trust_domain)
            .and_then(|keys| keys.get(kid))
            .cloned();
        key.ok_or_else(|| {
            debug!(trust_domain = %trust_domain, kid, "no matching JWT signing key");
            JwtSvidError::KeyNotFound {
                trust_domain: trust_domain.to_string(),
                kid: kid.to_string(),
            }
        })
    }
}

/// Shared handle whose key set is replaced wholesale on refresh.
///
/// Each lookup reads one snapshot; a refresh never mutates a snapshot that
/// an in-flight validation is using.
#[derive(Debug)]
pub struct KeyStoreHandle {
    cell: ConfigCell<TrustDomainKeyStore>,
}

impl KeyStoreHandle {
    /// A handle with no keys published yet. Lookups fail with
    /// `Unconfigured` until the first [`KeyStoreHandle::refresh`].
    pub fn new() -> Self {
        Self {
            cell: ConfigCell::new("jwt key store"),
        }
    }

    pub fn with_keys(keys: TrustDomainKeyStore) -> Self {
        Self {
            cell: ConfigCell::configured("jwt key store", keys),
        }
    }

    /// Publish a new key set, returning the one it replaced.
    pub fn refresh(&self, keys: TrustDomainKeyStore) -> Option<Arc<TrustDomainKeyStore>> {
        debug!(keys = keys.len(), "publishing JWT key set");
        self.cell.configure(keys)
    }

    pub fn snapshot(&self) -> Result<Arc<TrustDomainKeyStore>> {
        Ok(self.cell.load()?)
    }
}

impl Default for KeyStoreHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore for KeyStoreHandle {
    fn find_public_key(&self, trust_domain: &TrustDomain, kid: &str) -> Result<Arc<JwtPublicKey>> {
        self.snapshot()?.find_public_key(trust_domain, kid)
    }
}

impl<K: KeyStore + ?Sized> KeyStore for Arc<K> {
    fn find_public_key(&self, trust_domain: &TrustDomain, kid: &str) -> Result<Arc<JwtPublicKey>> {
        (**self).find_public_key(trust_domain, kid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trustbind_core::CoreError;

    const EC_PUB: &str = include_str!("../testdata/ec-pub.pem");
    const EC384_PUB: &str = include_str!("../testdata/ec384-pub.pem");

    fn td(name: &str) -> TrustDomain {
        TrustDomain::new(name).unwrap()
    }

    fn store() -> TrustDomainKeyStore {
        TrustDomainKeyStore::new()
            .with_key(td("example.org"), "k1", JwtPublicKey::from_public_key_pem(EC_PUB).unwrap())
            .with_key(td("other.org"), "k2", JwtPublicKey::from_public_key_pem(EC384_PUB).unwrap())
    }

    #[test]
    fn test_lookup_is_scoped_to_trust_domain() {
        let store = store();
        assert_eq!(store.len(), 2);

        let key = store.find_public_key(&td("example.org"), "k1").unwrap();
        assert!(matches!(*key, JwtPublicKey::P256(_)));

        // k2 exists, but only under other.org
        let err = store.find_public_key(&td("example.org"), "k2").unwrap_err();
        assert!(matches!(
            err,
            JwtSvidError::KeyNotFound { ref trust_domain, ref kid }
                if trust_domain == "example.org" && kid == "k2"
        ));
    }

    #[test]
    fn test_unknown_trust_domain() {
        let err = store().find_public_key(&td("nowhere.test"), "k1").unwrap_err();
        assert!(matches!(err, JwtSvidError::KeyNotFound { .. }));
        assert!(err.is_security_failure());
    }

    #[test]
    fn test_handle_unconfigured_then_refreshed() {
        let handle = KeyStoreHandle::new();
        let err = handle.find_public_key(&td("example.org"), "k1").unwrap_err();
        assert!(matches!(err, JwtSvidError::Core(CoreError::Unconfigured(_))));
        assert!(err.is_configuration());

        assert!(handle.refresh(store()).is_none());
        assert!(handle.find_public_key(&td("example.org"), "k1").is_ok());
    }

    #[test]
    fn test_refresh_swaps_whole_snapshot() {
        let handle = KeyStoreHandle::with_keys(store());
        let before = handle.snapshot().unwrap();

        let replaced = handle.refresh(TrustDomainKeyStore::new()).unwrap();
        assert!(Arc::ptr_eq(&before, &replaced));

        // The old snapshot still answers; the handle no longer does
        assert!(before.find_public_key(&td("example.org"), "k1").is_ok());
        assert!(handle.find_public_key(&td("example.org"), "k1").is_err());
    }
}
