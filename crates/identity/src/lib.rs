//! JWT-SVID validation for Trustbind.
//!
//! A JWT-SVID is a compact JWS whose `sub` claim is a SPIFFE ID. Validation
//! turns such a bearer token into a [`VerifiedIdentity`]: the SPIFFE ID plus
//! the verified claim map.
//!
//! # Security Model
//!
//! - Only asymmetric algorithms are accepted (`RS*`, `ES*`, `PS*`)
//! - Keys are looked up by (trust domain of the subject, key id); a key id
//!   registered under another trust domain never matches
//! - Claims read before signature verification are used for key selection
//!   only and are never returned
//! - Key sets are replaced wholesale through [`KeyStoreHandle`]
//!
//! # Example
//!
//! ```no_run
//! use trustbind_identity::{JwtPublicKey, JwtSvidValidator, TrustDomainKeyStore, ValidatorConfig};
//! use trustbind_core::TrustDomain;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let key = JwtPublicKey::from_public_key_pem(&std::fs::read_to_string("bundle-key.pem")?)?;
//! let keys = TrustDomainKeyStore::new().with_key(TrustDomain::new("example.org")?, "k1", key);
//!
//! let validator = JwtSvidValidator::new(&ValidatorConfig::default());
//! # let token = "";
//! let identity = validator.validate(token, &keys, &["my-service"])?;
//! println!("caller is {}", identity.spiffe_id());
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod jwtsvid;
pub mod key;
pub mod keystore;

pub use error::{JwtSvidError, Result};
pub use jwtsvid::{
    validate_token, JwtSvidValidator, ValidatorConfig, VerifiedIdentity, DEFAULT_LEEWAY_SECS,
};
pub use key::{Algorithm, JwtPublicKey};
pub use keystore::{KeyStore, KeyStoreHandle, TrustDomainKeyStore};
