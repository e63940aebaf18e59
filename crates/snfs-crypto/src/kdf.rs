//! Key derivation: Argon2id passphrase → wrapping key

use argon2::{Algorithm, Argon2, Params, Version};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::{KEY_SIZE, SALT_SIZE};

/// Largest accepted Argon2id memory cost (4 GiB)
pub const MAX_MEM_COST_KIB: u32 = 4 * 1024 * 1024;
/// Largest accepted Argon2id time cost
pub const MAX_TIME_COST: u32 = 64;
/// Largest accepted Argon2id parallelism
pub const MAX_PARALLELISM: u32 = 64;

/// A 256-bit key derived from the passphrase. It only ever wraps the master
/// key and is never persisted.
pub struct WrappingKey {
    bytes: [u8; KEY_SIZE],
}

impl WrappingKey {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for WrappingKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for WrappingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappingKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Argon2id parameters, stored in the key file next to the salt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    /// Reject parameters outside what an interactive unlock can afford.
    /// Parameters read from a key file are untrusted.
    pub fn check(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            (1..=MAX_PARALLELISM).contains(&self.parallelism),
            "Argon2id parallelism {} outside 1..={MAX_PARALLELISM}",
            self.parallelism
        );
        anyhow::ensure!(
            (1..=MAX_TIME_COST).contains(&self.time_cost),
            "Argon2id time cost {} outside 1..={MAX_TIME_COST}",
            self.time_cost
        );
        anyhow::ensure!(
            (8 * self.parallelism..=MAX_MEM_COST_KIB).contains(&self.mem_cost_kib),
            "Argon2id memory cost {} KiB outside {}..={MAX_MEM_COST_KIB}",
            self.mem_cost_kib,
            8 * self.parallelism
        );
        Ok(())
    }
}

impl From<&snfs_core::config::CryptoConfig> for KdfParams {
    fn from(cfg: &snfs_core::config::CryptoConfig) -> Self {
        Self {
            mem_cost_kib: cfg.argon2_mem_cost_kib,
            time_cost: cfg.argon2_time_cost,
            parallelism: cfg.argon2_parallelism,
        }
    }
}

/// Derive the 256-bit wrapping key from a passphrase and salt using Argon2id.
pub fn derive_wrapping_key(
    passphrase: &SecretString,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> anyhow::Result<WrappingKey> {
    params.check()?;
    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| anyhow::anyhow!("invalid Argon2id params: {e}"))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = WrappingKey {
        bytes: [0u8; KEY_SIZE],
    };
    argon2
        .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut key.bytes)
        .map_err(|e| anyhow::anyhow!("Argon2id KDF failed: {e}"))?;

    Ok(key)
}

#[cfg(test)]
pub(crate) fn fast_params() -> KdfParams {
    KdfParams {
        mem_cost_kib: 1024,
        time_cost: 1,
        parallelism: 1,
    }
}
