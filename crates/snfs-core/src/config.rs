use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{SnfsError, SnfsResult};

/// Smallest accepted block size in bytes
pub const MIN_BLOCK_SIZE: u32 = 512;
/// Largest accepted block size in bytes (1 MiB)
pub const MAX_BLOCK_SIZE: u32 = 1024 * 1024;
/// Default block size for newly created files
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Top-level configuration (loaded from snfs.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnfsConfig {
    pub daemon: DaemonConfig,
    pub paths: PathsConfig,
    pub crypto: CryptoConfig,
    pub fuse: FuseConfig,
    pub archive: ArchiveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Mountpoint exposing the plaintext view (default: ./notes)
    pub virtual_root: PathBuf,
    /// Directory holding the encrypted files (default: ./data)
    pub physical_root: PathBuf,
    /// Wrapped master key file (default: ~/.securenotefs/key)
    pub key_file: PathBuf,
}

/// Key derivation and block format settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
    /// Block size for newly created files (default: 4096)
    pub block_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FuseConfig {
    /// Pass allow_other to the mount
    pub allow_other: bool,
    /// Maximum decoded blocks cached per open handle
    pub cache_blocks: usize,
    /// Kernel attribute cache TTL in seconds
    pub attr_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Enable snapshot/restore of the physical root
    pub enabled: bool,
    /// Directory holding snapshot bundles (default: .)
    pub dir: PathBuf,
    /// Restore the newest snapshot when the physical root is empty
    pub restore_on_start: bool,
    /// Snapshot the physical root after unmount
    pub snapshot_on_exit: bool,
    /// Number of snapshots retained after pruning (0 = keep all)
    pub keep: usize,
    /// zstd compression level for bundles
    pub compression_level: i32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            virtual_root: PathBuf::from("notes"),
            physical_root: PathBuf::from("data"),
            key_file: PathBuf::from("~/.securenotefs/key"),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl Default for FuseConfig {
    fn default() -> Self {
        Self {
            allow_other: false,
            cache_blocks: 256,
            attr_ttl_secs: 1,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("."),
            restore_on_start: true,
            snapshot_on_exit: true,
            keep: 10,
            compression_level: 3,
        }
    }
}

impl SnfsConfig {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> SnfsResult<Self> {
        if !path.exists() {
            tracing::warn!("config file not found: {}  (using defaults)", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| SnfsError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the storage engine cannot honour.
    pub fn validate(&self) -> SnfsResult<()> {
        validate_block_size(self.crypto.block_size)?;
        if self.fuse.cache_blocks == 0 {
            return Err(SnfsError::Config("fuse.cache_blocks must be at least 1".into()));
        }
        if self.paths.virtual_root == self.paths.physical_root {
            return Err(SnfsError::Config(
                "virtual_root and physical_root must differ".into(),
            ));
        }
        Ok(())
    }
}

/// Block sizes must be powers of two within [`MIN_BLOCK_SIZE`, `MAX_BLOCK_SIZE`].
pub fn validate_block_size(block_size: u32) -> SnfsResult<()> {
    if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
        return Err(SnfsError::Config(format!(
            "block_size {block_size} must be a power of two between {MIN_BLOCK_SIZE} and {MAX_BLOCK_SIZE}"
        )));
    }
    Ok(())
}

/// Expand `~` in path to the user's home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_default();
        PathBuf::from(home).join(rest)
    } else {
        path.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[daemon]
log_level = "debug"
log_format = "json"

[paths]
virtual_root = "/mnt/notes"
physical_root = "/var/lib/snfs/data"
key_file = "/etc/snfs/key"

[crypto]
argon2_mem_cost_kib = 131072
argon2_time_cost = 4
argon2_parallelism = 8
block_size = 16384

[fuse]
allow_other = true
cache_blocks = 64
attr_ttl_secs = 5

[archive]
enabled = true
dir = "/var/backups/snfs"
restore_on_start = false
snapshot_on_exit = true
keep = 3
compression_level = 9
"#;
        let config: SnfsConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.paths.virtual_root, PathBuf::from("/mnt/notes"));
        assert_eq!(config.paths.key_file, PathBuf::from("/etc/snfs/key"));
        assert_eq!(config.crypto.argon2_mem_cost_kib, 131072);
        assert_eq!(config.crypto.block_size, 16384);
        assert!(config.fuse.allow_other);
        assert_eq!(config.fuse.cache_blocks, 64);
        assert!(!config.archive.restore_on_start);
        assert_eq!(config.archive.keep, 3);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_defaults() {
        let config: SnfsConfig = toml::from_str("").unwrap();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.paths.virtual_root, PathBuf::from("notes"));
        assert_eq!(config.paths.physical_root, PathBuf::from("data"));
        assert_eq!(config.crypto.argon2_mem_cost_kib, 65536);
        assert_eq!(config.crypto.block_size, DEFAULT_BLOCK_SIZE);
        assert!(config.archive.enabled);
        assert_eq!(config.archive.keep, 10);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[crypto]
block_size = 8192
"#;
        let config: SnfsConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.crypto.block_size, 8192);
        assert_eq!(config.crypto.argon2_time_cost, 3);
        assert_eq!(config.fuse.cache_blocks, 256);
    }

    #[test]
    fn test_rejects_bad_block_size() {
        assert!(validate_block_size(4096).is_ok());
        assert!(validate_block_size(3000).is_err());
        assert!(validate_block_size(256).is_err());
        assert!(validate_block_size(2 * 1024 * 1024).is_err());
    }

    #[test]
    fn test_rejects_identical_roots() {
        let mut config = SnfsConfig::default();
        config.paths.physical_root = config.paths.virtual_root.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SnfsConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.paths.physical_root, PathBuf::from("data"));
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snfs.toml");
        std::fs::write(&path, "[crypto\nblock_size = ").unwrap();
        assert!(matches!(SnfsConfig::load(&path), Err(SnfsError::Config(_))));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = SnfsConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: SnfsConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.paths.key_file, parsed.paths.key_file);
        assert_eq!(config.crypto.block_size, parsed.crypto.block_size);
    }

    #[test]
    fn test_expand_tilde_leaves_plain_paths() {
        assert_eq!(expand_tilde(Path::new("data")), PathBuf::from("data"));
    }
}
