//! On-disk configuration: the Diffie-Hellman group, the password salt, and
//! the username → verifier table.
//!
//! Both files are JSON. Verifiers are stored as lowercase hex of the
//! fixed-width big-endian group element.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use num_bigint::BigUint;
use num_traits::Num;
use serde::{Deserialize, Serialize};

use crate::group::{DhGroup, DEFAULT_GENERATOR, MODP_1536_PRIME_HEX};

const DEFAULT_SALT: &str = "tessera";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Safe prime `p` as hex.
    pub prime: String,
    pub generator: u32,
    pub salt: String,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            prime: MODP_1536_PRIME_HEX.to_owned(),
            generator: DEFAULT_GENERATOR,
            salt: DEFAULT_SALT.to_owned(),
        }
    }
}

impl GroupConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read group config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid group config {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write group config {}", path.display()))
    }

    pub fn group(&self) -> Result<DhGroup> {
        let p = BigUint::from_str_radix(self.prime.trim(), 16).context("prime is not valid hex")?;
        DhGroup::new(p, BigUint::from(self.generator)).context("invalid group parameters")
    }

    pub fn salt(&self) -> &[u8] {
        self.salt.as_bytes()
    }
}

// ============================================================================
// Verifiers
// ============================================================================

/// Lookup of a user's password verifier `g^H(password ‖ salt) mod p`.
pub trait VerifierStore {
    fn verifier(&self, user: &str) -> Option<BigUint>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VerifierTable {
    entries: BTreeMap<String, String>,
}

impl VerifierTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read verifier table {}", path.display()))?;
        let table: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid verifier table {}", path.display()))?;
        for (user, value) in &table.entries {
            hex::decode(value).with_context(|| format!("verifier for {} is not hex", user))?;
        }
        Ok(table)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write verifier table {}", path.display()))
    }

    pub fn insert(&mut self, group: &DhGroup, user: &str, verifier: &BigUint) {
        self.entries
            .insert(user.to_lowercase(), hex::encode(group.encode(verifier)));
    }

    /// Compute and store the verifier for `password`.
    pub fn enroll(&mut self, group: &DhGroup, salt: &[u8], user: &str, password: &str) {
        let verifier = enroll(group, salt, password);
        self.insert(group, user, &verifier);
    }

    pub fn remove(&mut self, user: &str) -> bool {
        self.entries.remove(&user.to_lowercase()).is_some()
    }

    pub fn users(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl VerifierStore for VerifierTable {
    fn verifier(&self, user: &str) -> Option<BigUint> {
        let value = self.entries.get(&user.to_lowercase())?;
        let bytes = hex::decode(value).ok()?;
        Some(BigUint::from_bytes_be(&bytes))
    }
}

/// The verifier a server stores for `password`.
pub fn enroll(group: &DhGroup, salt: &[u8], password: &str) -> BigUint {
    group.password_secret(password.as_bytes(), salt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_group_config_is_modp_1536() {
        let config = GroupConfig::default();
        let group = config.group().unwrap();
        assert_eq!(group, DhGroup::modp_1536());
        assert_eq!(config.salt(), b"tessera");
    }

    #[test]
    fn test_group_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("group.json");
        let config = GroupConfig { salt: "pepper".into(), ..GroupConfig::default() };

        config.save(&path).unwrap();
        assert_eq!(GroupConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_group_config_rejects_bad_prime() {
        let config = GroupConfig { prime: "not hex".into(), ..GroupConfig::default() };
        assert!(config.group().is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("group.json");
        std::fs::write(&path, "{ \"prime\": 5 }").unwrap();
        assert!(GroupConfig::load(&path).is_err());
    }

    #[test]
    fn test_enroll_matches_password_secret() {
        let group = DhGroup::modp_1536();
        let mut table = VerifierTable::new();
        table.enroll(&group, b"salt", "alice", "secret");

        assert_eq!(table.verifier("alice"), Some(group.password_secret(b"secret", b"salt")));
        assert_eq!(table.verifier("ALICE"), table.verifier("alice"));
        assert_eq!(table.verifier("bob"), None);
    }

    #[test]
    fn test_verifier_table_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verifiers.json");
        let group = DhGroup::modp_1536();

        let mut table = VerifierTable::new();
        table.enroll(&group, b"salt", "Alice", "secret");
        table.enroll(&group, b"salt", "bob", "hunter2");
        table.save(&path).unwrap();

        let loaded = VerifierTable::load(&path).unwrap();
        assert_eq!(loaded, table);
        assert_eq!(loaded.users().collect::<Vec<_>>(), vec!["alice", "bob"]);
    }

    #[test]
    fn test_verifier_table_rejects_non_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("verifiers.json");
        std::fs::write(&path, r#"{"alice": "zz"}"#).unwrap();
        assert!(VerifierTable::load(&path).is_err());
    }
}
