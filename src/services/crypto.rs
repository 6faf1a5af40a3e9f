//! Credential cipher for remote calendar secrets.
//!
//! Secrets are encrypted with AES-256-CBC under a fresh random IV and stored as
//! `base64(IV || ciphertext || HMAC-SHA256(IV || ciphertext))`. The key pair is
//! derived once with Argon2id from the configured secret and salt.

use aes::Aes256;
use argon2::Argon2;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;

use crate::config::EncryptionConfig;
use crate::error::{SyncError, SyncResult};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

const IV_LEN: usize = 16;
const TAG_LEN: usize = 32;
const KEY_LEN: usize = 32;
const BLOCK_LEN: usize = 16;

/// Plaintext round-tripped by [`CredentialCipher::self_check`].
pub const SELF_CHECK_PROBE: &str = "test-encryption-validation";

pub struct CredentialCipher {
    enc_key: [u8; KEY_LEN],
    mac_key: [u8; KEY_LEN],
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher")
            .field("enc_key", &"[REDACTED]")
            .field("mac_key", &"[REDACTED]")
            .finish()
    }
}

impl CredentialCipher {
    /// Derive the cipher keys from a secret and salt with Argon2id.
    pub fn new(secret: &str, salt: &str) -> SyncResult<Self> {
        if secret.is_empty() {
            return Err(SyncError::Encryption(
                "encryption secret must not be empty".to_string(),
            ));
        }

        let mut okm = [0u8; KEY_LEN * 2];
        Argon2::default()
            .hash_password_into(secret.as_bytes(), salt.as_bytes(), &mut okm)
            .map_err(|e| SyncError::Encryption(format!("key derivation failed: {}", e)))?;

        let mut enc_key = [0u8; KEY_LEN];
        let mut mac_key = [0u8; KEY_LEN];
        enc_key.copy_from_slice(&okm[..KEY_LEN]);
        mac_key.copy_from_slice(&okm[KEY_LEN..]);

        Ok(Self { enc_key, mac_key })
    }

    pub fn from_config(config: &EncryptionConfig) -> SyncResult<Self> {
        Self::new(&config.secret, &config.salt)
    }

    pub fn encrypt(&self, plaintext: &str) -> SyncResult<String> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new_from_slices(&self.enc_key, &iv)
            .map_err(|_| SyncError::Encryption("invalid key length".to_string()))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        let mut blob = Vec::with_capacity(IV_LEN + ciphertext.len() + TAG_LEN);
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&ciphertext);

        let tag = self.mac()?.chain_update(&blob).finalize().into_bytes();
        blob.extend_from_slice(&tag);

        Ok(BASE64.encode(blob))
    }

    /// Decrypt a blob produced by [`encrypt`](Self::encrypt).
    ///
    /// Every failure collapses into the same error so callers cannot tell a
    /// tampered blob from a wrong key.
    pub fn decrypt(&self, blob: &str) -> SyncResult<String> {
        let failed = || SyncError::Encryption("decryption failed".to_string());

        let raw = BASE64.decode(blob.trim()).map_err(|_| failed())?;
        if raw.len() < IV_LEN + BLOCK_LEN + TAG_LEN {
            return Err(failed());
        }

        let (signed, tag) = raw.split_at(raw.len() - TAG_LEN);
        self.mac()?
            .chain_update(signed)
            .verify_slice(tag)
            .map_err(|_| failed())?;

        let (iv, ciphertext) = signed.split_at(IV_LEN);
        let plaintext = Aes256CbcDec::new_from_slices(&self.enc_key, iv)
            .map_err(|_| failed())?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| failed())?;

        String::from_utf8(plaintext).map_err(|_| failed())
    }

    /// Encrypt and decrypt a fixed probe. Run at startup; a failure means the
    /// configured key material is unusable.
    pub fn self_check(&self) -> SyncResult<()> {
        let blob = self.encrypt(SELF_CHECK_PROBE)?;
        if self.decrypt(&blob)? != SELF_CHECK_PROBE {
            return Err(SyncError::Encryption(
                "self-check round trip mismatch".to_string(),
            ));
        }
        Ok(())
    }

    fn mac(&self) -> SyncResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.mac_key)
            .map_err(|_| SyncError::Encryption("failed to create HMAC".to_string()))
    }
}

/// Shared cipher for tests; Argon2 is slow in debug builds.
#[cfg(test)]
pub fn test_cipher() -> std::sync::Arc<CredentialCipher> {
    use std::sync::{Arc, OnceLock};

    static CIPHER: OnceLock<Arc<CredentialCipher>> = OnceLock::new();
    CIPHER
        .get_or_init(|| {
            Arc::new(CredentialCipher::new("test-secret", "test-salt-value").unwrap())
        })
        .clone()
}
