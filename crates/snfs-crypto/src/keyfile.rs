//! Persisted key file: salt, KDF parameters, and the wrapped master key.
//!
//! ```json
//! {
//!   "version": 1,
//!   "kdf": { "algorithm": "argon2id", "mem_cost_kib": 65536, "time_cost": 3, "parallelism": 4 },
//!   "salt": "<base64, 16 bytes>",
//!   "wrapped_master_key": "<base64, 24-byte nonce || 32-byte key || 16-byte tag>"
//! }
//! ```
//!
//! Every failure to open an existing key file (wrong passphrase, malformed
//! JSON or base64, bad lengths, failed AEAD) is reported as the same
//! `AuthenticationFailure`.

use std::io::Write;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use snfs_core::{SnfsError, SnfsResult};
use tracing::{debug, info};

use crate::kdf::{derive_wrapping_key, KdfParams};
use crate::keys::{generate_master_key, unwrap_master_key, wrap_master_key, MasterKey};
use crate::SALT_SIZE;

/// Current key file format version
pub const KEYFILE_VERSION: u32 = 1;

const KDF_ALGORITHM: &str = "argon2id";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfDescriptor {
    pub algorithm: String,
    #[serde(flatten)]
    pub params: KdfParams,
}

/// On-disk key material. Contains nothing usable without the passphrase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFile {
    pub version: u32,
    pub kdf: KdfDescriptor,
    pub salt: String,
    pub wrapped_master_key: String,
}

impl KeyFile {
    /// Wrap `master` under a key derived from `passphrase` with a fresh salt.
    ///
    /// The passphrase is consumed and zeroized as soon as derivation finishes.
    pub fn seal(
        passphrase: SecretString,
        master: &MasterKey,
        params: &KdfParams,
    ) -> SnfsResult<Self> {
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);

        let derived = derive_wrapping_key(&passphrase, &salt, params);
        drop(passphrase);
        let wrapping = derived.map_err(|e| SnfsError::Config(e.to_string()))?;

        let wrapped = wrap_master_key(&wrapping, master)?;
        Ok(Self {
            version: KEYFILE_VERSION,
            kdf: KdfDescriptor {
                algorithm: KDF_ALGORITHM.into(),
                params: params.clone(),
            },
            salt: STANDARD.encode(salt),
            wrapped_master_key: STANDARD.encode(wrapped),
        })
    }

    /// Read a key file. A missing file is `MissingKeyFile` (first run);
    /// unparseable content is `AuthenticationFailure`.
    pub fn load(path: &Path) -> SnfsResult<Self> {
        let data = match std::fs::read(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnfsError::MissingKeyFile(path.to_path_buf()))
            }
            Err(e) => return Err(SnfsError::Storage(e)),
        };
        serde_json::from_slice(&data).map_err(|_| SnfsError::AuthenticationFailure)
    }

    /// Persist atomically (temp file + rename), owner-only permissions on Unix.
    pub fn save(&self, path: &Path) -> SnfsResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| SnfsError::Other(anyhow::anyhow!("key file serialization: {e}")))?;

        let tmp = path.with_extension("tmp");
        {
            let mut opts = std::fs::OpenOptions::new();
            opts.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                opts.mode(0o600);
            }
            let mut file = opts.open(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn decoded_salt(&self) -> SnfsResult<[u8; SALT_SIZE]> {
        let bytes = STANDARD
            .decode(&self.salt)
            .map_err(|_| SnfsError::AuthenticationFailure)?;
        bytes
            .try_into()
            .map_err(|_| SnfsError::AuthenticationFailure)
    }
}

/// Open the wrapped master key with `passphrase`.
///
/// The passphrase is consumed and zeroized right after derivation, on both
/// success and failure paths.
pub fn unlock_key_file(passphrase: SecretString, key_file: &KeyFile) -> SnfsResult<MasterKey> {
    if key_file.version != KEYFILE_VERSION
        || key_file.kdf.algorithm != KDF_ALGORITHM
        || key_file.kdf.params.check().is_err()
    {
        drop(passphrase);
        return Err(SnfsError::AuthenticationFailure);
    }
    let salt = match key_file.decoded_salt() {
        Ok(s) => s,
        Err(e) => {
            drop(passphrase);
            return Err(e);
        }
    };

    let derived = derive_wrapping_key(&passphrase, &salt, &key_file.kdf.params);
    drop(passphrase);
    let wrapping = derived.map_err(|_| SnfsError::AuthenticationFailure)?;

    let wrapped = STANDARD
        .decode(&key_file.wrapped_master_key)
        .map_err(|_| SnfsError::AuthenticationFailure)?;
    unwrap_master_key(&wrapping, &wrapped).map_err(|_| SnfsError::AuthenticationFailure)
}

/// Key custody for one installation: a key file path plus the KDF
/// parameters used when (re)wrapping.
#[derive(Debug, Clone)]
pub struct KeyManager {
    path: PathBuf,
    params: KdfParams,
}

impl KeyManager {
    pub fn new(path: PathBuf, params: KdfParams) -> Self {
        Self { path, params }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True once `first_run_setup` has written a key file.
    pub fn is_initialized(&self) -> bool {
        self.path.exists()
    }

    /// Generate a fresh master key, wrap it under `passphrase`, and persist
    /// the key file. Refuses to replace an existing key file.
    pub fn first_run_setup(&self, passphrase: SecretString) -> SnfsResult<(KeyFile, MasterKey)> {
        if self.is_initialized() {
            drop(passphrase);
            return Err(SnfsError::InvalidArgument(format!(
                "key file already exists: {}",
                self.path.display()
            )));
        }

        let master = generate_master_key();
        let key_file = KeyFile::seal(passphrase, &master, &self.params)?;
        key_file.save(&self.path)?;

        info!(path = %self.path.display(), "key file created");
        Ok((key_file, master))
    }

    /// Load the key file and unlock the master key.
    pub fn unlock(&self, passphrase: SecretString) -> SnfsResult<MasterKey> {
        let key_file = match KeyFile::load(&self.path) {
            Ok(k) => k,
            Err(e) => {
                drop(passphrase);
                return Err(e);
            }
        };
        let master = unlock_key_file(passphrase, &key_file)?;
        debug!(path = %self.path.display(), "master key unlocked");
        Ok(master)
    }

    /// Rewrap the existing master key under a new passphrase and salt.
    ///
    /// Stored blocks stay valid: only the wrapping changes.
    pub fn change_passphrase(&self, old: SecretString, new: SecretString) -> SnfsResult<()> {
        let master = match self.unlock(old) {
            Ok(m) => m,
            Err(e) => {
                drop(new);
                return Err(e);
            }
        };
        let key_file = KeyFile::seal(new, &master, &self.params)?;
        key_file.save(&self.path)?;
        info!(path = %self.path.display(), "passphrase changed");
        Ok(())
    }
}
