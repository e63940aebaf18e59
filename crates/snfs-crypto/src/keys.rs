//! Master key generation, wrapping, and HKDF sub-key derivation

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use crate::kdf::WrappingKey;
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// The 256-bit master key. Generated once at first run, held only in
/// process memory, zeroized on drop.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random 256-bit master key.
pub fn generate_master_key() -> MasterKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    MasterKey::from_bytes(bytes)
}

/// Expand the master key into a 512-bit AES-256-SIV key for one domain.
pub(crate) fn derive_siv_key(
    master: &MasterKey,
    info: &[u8],
) -> anyhow::Result<Zeroizing<[u8; 2 * KEY_SIZE]>> {
    let hkdf = Hkdf::<Sha256>::new(None, master.as_bytes());
    let mut okm = Zeroizing::new([0u8; 2 * KEY_SIZE]);
    hkdf.expand(info, &mut okm[..])
        .map_err(|e| anyhow::anyhow!("HKDF expand failed: {e}"))?;
    Ok(okm)
}

/// Wrap (encrypt) the master key under the passphrase-derived wrapping key.
///
/// Uses XChaCha20-Poly1305 with a random nonce.
/// Output: `[24-byte nonce][ciphertext + 16-byte tag]`
pub fn wrap_master_key(wrapping: &WrappingKey, master: &MasterKey) -> anyhow::Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(wrapping.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, master.as_bytes().as_ref())
        .map_err(|e| anyhow::anyhow!("key wrapping failed: {e}"))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Unwrap (decrypt) the master key.
///
/// Input: `[24-byte nonce][ciphertext + 16-byte tag]` (output of `wrap_master_key`)
pub fn unwrap_master_key(wrapping: &WrappingKey, wrapped: &[u8]) -> anyhow::Result<MasterKey> {
    if wrapped.len() != NONCE_SIZE + KEY_SIZE + TAG_SIZE {
        anyhow::bail!(
            "wrapped key has wrong size: {} bytes (expected {})",
            wrapped.len(),
            NONCE_SIZE + KEY_SIZE + TAG_SIZE
        );
    }

    let (nonce_bytes, ciphertext) = wrapped.split_at(NONCE_SIZE);
    let nonce = XNonce::from_slice(nonce_bytes);
    let cipher = XChaCha20Poly1305::new(wrapping.as_bytes().into());

    let plaintext = Zeroizing::new(
        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| anyhow::anyhow!("key unwrapping failed"))?,
    );

    let mut key_bytes = [0u8; KEY_SIZE];
    key_bytes.copy_from_slice(&plaintext);
    Ok(MasterKey::from_bytes(key_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::{derive_wrapping_key, fast_params};
    use crate::SALT_SIZE;
    use secrecy::SecretString;

    fn wrapping_key(pass: &str) -> WrappingKey {
        derive_wrapping_key(&SecretString::from(pass), &[9u8; SALT_SIZE], &fast_params()).unwrap()
    }

    #[test]
    fn test_master_key_generation() {
        let k1 = generate_master_key();
        let k2 = generate_master_key();
        assert_ne!(k1.as_bytes(), k2.as_bytes(), "random keys must differ");
    }

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let wrapping = wrapping_key("correct horse");
        let master = generate_master_key();

        let wrapped = wrap_master_key(&wrapping, &master).unwrap();
        let unwrapped = unwrap_master_key(&wrapping, &wrapped).unwrap();

        assert_eq!(master.as_bytes(), unwrapped.as_bytes());
    }

    #[test]
    fn test_unwrap_wrong_wrapping_key() {
        let master = generate_master_key();
        let wrapped = wrap_master_key(&wrapping_key("right"), &master).unwrap();

        assert!(unwrap_master_key(&wrapping_key("wrong"), &wrapped).is_err());
    }

    #[test]
    fn test_unwrap_truncated() {
        let master = generate_master_key();
        let wrapped = wrap_master_key(&wrapping_key("pw"), &master).unwrap();

        assert!(unwrap_master_key(&wrapping_key("pw"), &wrapped[..wrapped.len() - 1]).is_err());
    }

    #[test]
    fn test_wrapped_key_size() {
        let wrapped = wrap_master_key(&wrapping_key("pw"), &generate_master_key()).unwrap();
        // nonce (24) + key (32) + tag (16) = 72
        assert_eq!(wrapped.len(), NONCE_SIZE + KEY_SIZE + TAG_SIZE);
    }

    #[test]
    fn test_siv_domains_differ() {
        let master = MasterKey::from_bytes([42u8; KEY_SIZE]);
        let a = derive_siv_key(&master, b"snfs-block-siv").unwrap();
        let b = derive_siv_key(&master, b"snfs-header-siv").unwrap();
        assert_ne!(*a, *b, "different domains must produce different keys");
    }
}
