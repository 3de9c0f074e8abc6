//! API keys of the form `nxp_<prefix>_<secret>`.
//!
//! The prefix is a non-secret lookup handle; only an Argon2 hash of the
//! secret is stored.

use std::fmt;

use anyhow::{anyhow, Result};
use argon2::password_hash::rand_core::{OsRng, RngCore};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use subtle::ConstantTimeEq;

pub const KEY_SCHEME: &str = "nxp";
/// 48 bits of prefix, shown as 12 hex characters.
const PREFIX_BYTES: usize = 6;
const SECRET_BYTES: usize = 32;
const HASH_MEMORY_KIB: u32 = 8 * 1024;

pub struct GeneratedKey {
    pub plaintext: String,
    pub prefix: String,
    pub hashed_secret: String,
}

impl fmt::Debug for GeneratedKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("GeneratedKey")
            .field("prefix", &self.prefix)
            .field("plaintext", &"***")
            .finish_non_exhaustive()
    }
}

/// The secret is 256 random bits, so the hash does not need to be
/// expensive; it only has to be one-way.
fn hasher() -> Result<Argon2<'static>> {
    let params = Params::new(HASH_MEMORY_KIB, 1, 1, None).map_err(|error| anyhow!("argon2 params: {error}"))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// # Errors
/// Returns an error if hashing fails.
pub fn generate() -> Result<GeneratedKey> {
    let mut prefix_bytes = [0_u8; PREFIX_BYTES];
    let mut secret_bytes = [0_u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut prefix_bytes);
    OsRng.fill_bytes(&mut secret_bytes);

    let prefix = hex::encode(prefix_bytes);
    let secret = hex::encode(secret_bytes);
    let hashed_secret = hash_secret(&secret)?;

    Ok(GeneratedKey {
        plaintext: format!("{KEY_SCHEME}_{prefix}_{secret}"),
        prefix,
        hashed_secret,
    })
}

/// Splits a presented key into `(prefix, secret)`.
#[must_use]
pub fn parse(presented: &str) -> Option<(&str, &str)> {
    let rest = presented.strip_prefix(KEY_SCHEME)?.strip_prefix('_')?;
    let (prefix, secret) = rest.split_once('_')?;
    let prefix_ok = prefix.len() == PREFIX_BYTES * 2
        && prefix.bytes().all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte));
    if !prefix_ok || secret.is_empty() {
        return None;
    }
    Some((prefix, secret))
}

/// # Errors
/// Returns an error if hashing fails.
pub fn hash_secret(secret: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = hasher()?
        .hash_password(secret.as_bytes(), &salt)
        .map_err(|error| anyhow!("failed to hash API key: {error}"))?;
    Ok(hash.to_string())
}

#[must_use]
pub fn verify_secret(secret: &str, hashed_secret: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hashed_secret) else {
        return false;
    };
    hasher().is_ok_and(|hasher| hasher.verify_password(secret.as_bytes(), &parsed).is_ok())
}

#[must_use]
pub fn prefixes_match(stored: &str, presented: &str) -> bool {
    stored.as_bytes().ct_eq(presented.as_bytes()).unwrap_u8() == 1
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn generated_keys_parse_back_to_their_prefix() {
        let key = generate().expect("generate");
        let (prefix, secret) = parse(&key.plaintext).expect("parse");

        assert_eq!(prefix, key.prefix);
        assert_eq!(prefix.len(), 12);
        assert!(verify_secret(secret, &key.hashed_secret));
        assert!(!format!("{key:?}").contains(secret));
    }

    #[test]
    fn malformed_keys_do_not_parse() {
        assert!(parse("nxp_0123456789ab").is_none());
        assert!(parse("abc_0123456789ab_secret").is_none());
        assert!(parse("nxp_0123456789AB_secret").is_none());
        assert!(parse("nxp_0123_secret").is_none());
        assert!(parse("nxp_0123456789ab_").is_none());
    }

    #[test]
    fn distinct_keys_get_distinct_prefixes() {
        let first = generate().expect("first");
        let second = generate().expect("second");
        assert_ne!(first.prefix, second.prefix);
        assert_ne!(first.plaintext, second.plaintext);
    }

    #[test]
    fn prefix_comparison_is_exact() {
        assert!(prefixes_match("0123456789ab", "0123456789ab"));
        assert!(!prefixes_match("0123456789ab", "0123456789ac"));
        assert!(!prefixes_match("0123456789ab", "0123456789"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(12))]

        #[test]
        fn stored_hash_never_equals_the_secret(secret in "[ -~]{1,64}") {
            let hashed = hash_secret(&secret).expect("hash");
            prop_assert_ne!(&hashed, &secret);
            prop_assert!(!hashed.contains(&secret) || secret.len() < 4);
            prop_assert!(verify_secret(&secret, &hashed));
        }

        #[test]
        fn a_wrong_secret_never_verifies(right in "[a-f0-9]{8,64}", wrong in "[a-f0-9]{8,64}") {
            prop_assume!(right != wrong);
            let hashed = hash_secret(&right).expect("hash");
            prop_assert!(!verify_secret(&wrong, &hashed));
        }
    }
}
