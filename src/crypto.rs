//! Cipher codec
//!
//! Encrypts any serializable value with a password-derived key. The key is
//! SHA-256 of the password and the cipher is AES-256-GCM with a random nonce,
//! so ciphertexts of the same value differ between calls.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::debug;

use crate::error::{TelemetryError, TelemetryResult};

/// Algorithm tag written into every blob
pub const ALGORITHM: &str = "AES-256-GCM";

/// Opaque ciphertext plus the parameters needed to open it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    pub algorithm: String,
    /// Base64 nonce
    pub nonce: String,
    /// Base64 ciphertext with the GCM tag appended
    pub ciphertext: String,
}

impl EncryptedBlob {
    /// Parse a blob from its JSON form
    pub fn from_json(text: &str) -> TelemetryResult<Self> {
        serde_json::from_str(text.trim())
            .map_err(|e| TelemetryError::Decryption(format!("not an encrypted blob: {}", e)))
    }

    pub fn to_json(&self) -> TelemetryResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Read a blob from a file
    pub fn read_from(path: &Path) -> TelemetryResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Write the blob to a file, creating parent directories
    pub fn write_to(&self, path: &Path) -> TelemetryResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.to_json()?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).ok();
        }

        debug!("Wrote encrypted blob to {}", path.display());
        Ok(())
    }
}

/// Encrypt a serializable value with a password
pub fn encrypt<T: Serialize + ?Sized>(object: &T, password: &str) -> TelemetryResult<EncryptedBlob> {
    let key = derive_key(password)?;
    let mut in_out = serde_json::to_vec(object)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| TelemetryError::invalid("system random source unavailable"))?;

    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::empty(),
        &mut in_out,
    )
    .map_err(|_| TelemetryError::invalid("plaintext too large to encrypt"))?;

    Ok(EncryptedBlob {
        algorithm: ALGORITHM.to_string(),
        nonce: BASE64.encode(nonce_bytes),
        ciphertext: BASE64.encode(in_out),
    })
}

/// Decrypt a blob produced by [`encrypt`]
///
/// Fails with [`TelemetryError::Decryption`] on a wrong password or any
/// corruption; nothing is returned unless the whole blob authenticates.
pub fn decrypt<T: DeserializeOwned>(blob: &EncryptedBlob, password: &str) -> TelemetryResult<T> {
    if blob.algorithm != ALGORITHM {
        return Err(TelemetryError::Decryption(format!(
            "unsupported algorithm '{}'",
            blob.algorithm
        )));
    }

    let key = derive_key(password)?;

    let nonce_bytes: [u8; NONCE_LEN] = BASE64
        .decode(&blob.nonce)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| TelemetryError::Decryption("malformed nonce".to_string()))?;

    let mut in_out = BASE64
        .decode(&blob.ciphertext)
        .map_err(|e| TelemetryError::Decryption(format!("malformed ciphertext: {}", e)))?;

    let plaintext = key
        .open_in_place(Nonce::assume_unique_for_key(nonce_bytes), Aad::empty(), &mut in_out)
        .map_err(|_| TelemetryError::Decryption("wrong password or corrupt blob".to_string()))?;

    serde_json::from_slice(plaintext)
        .map_err(|e| TelemetryError::Decryption(format!("decrypted payload is not valid: {}", e)))
}

fn derive_key(password: &str) -> TelemetryResult<LessSafeKey> {
    if password.trim().is_empty() {
        return Err(TelemetryError::invalid("password must be a non-empty string"));
    }

    let digest = Sha256::digest(password.as_bytes());
    let unbound = UnboundKey::new(&AES_256_GCM, digest.as_slice())
        .map_err(|_| TelemetryError::invalid("could not derive key from password"))?;
    Ok(LessSafeKey::new(unbound))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample_config() -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("MONGO_URL".to_string(), "https://db.example.org".to_string());
        map.insert("MONGO_USER".to_string(), "tutor".to_string());
        map.insert("MONGO_PASSWORD".to_string(), "s3cr3t".to_string());
        map
    }

    #[test]
    fn test_encrypt_decrypt() {
        let config = sample_config();
        let blob = encrypt(&config, "course-key").unwrap();
        assert_eq!(blob.algorithm, ALGORITHM);

        let decrypted: BTreeMap<String, String> = decrypt(&blob, "course-key").unwrap();
        assert_eq!(decrypted, config);
    }

    #[test]
    fn test_encrypt_decrypt_with_unicode() {
        let data = vec!["Hello 世界! 🎉".to_string(), "ümlaut".to_string()];
        let blob = encrypt(&data, "unicode-key-🔐").unwrap();
        let decrypted: Vec<String> = decrypt(&blob, "unicode-key-🔐").unwrap();
        assert_eq!(decrypted, data);
    }

    #[test]
    fn test_wrong_password_fails() {
        let blob = encrypt(&sample_config(), "right").unwrap();
        let result: TelemetryResult<BTreeMap<String, String>> = decrypt(&blob, "wrong");
        assert!(matches!(result, Err(TelemetryError::Decryption(_))));
    }

    #[test]
    fn test_empty_password_rejected() {
        assert!(matches!(
            encrypt(&sample_config(), ""),
            Err(TelemetryError::InvalidArgument(_))
        ));
        assert!(matches!(
            encrypt(&sample_config(), "   "),
            Err(TelemetryError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let mut blob = encrypt(&sample_config(), "key").unwrap();
        let mut bytes = BASE64.decode(&blob.ciphertext).unwrap();
        bytes[0] ^= 0xff;
        blob.ciphertext = BASE64.encode(bytes);

        let result: TelemetryResult<BTreeMap<String, String>> = decrypt(&blob, "key");
        assert!(matches!(result, Err(TelemetryError::Decryption(_))));
    }

    #[test]
    fn test_garbage_blob_fails() {
        let blob = EncryptedBlob {
            algorithm: ALGORITHM.to_string(),
            nonce: "not base64!".to_string(),
            ciphertext: "also not".to_string(),
        };
        let result: TelemetryResult<BTreeMap<String, String>> = decrypt(&blob, "key");
        assert!(matches!(result, Err(TelemetryError::Decryption(_))));

        assert!(matches!(
            EncryptedBlob::from_json("plaintext credentials"),
            Err(TelemetryError::Decryption(_))
        ));
    }

    #[test]
    fn test_nonce_differs_between_calls() {
        let a = encrypt(&sample_config(), "key").unwrap();
        let b = encrypt(&sample_config(), "key").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_blob_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.enc");

        let blob = encrypt(&sample_config(), "key").unwrap();
        blob.write_to(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("s3cr3t"), "cache must hold ciphertext only");

        let loaded = EncryptedBlob::read_from(&path).unwrap();
        assert_eq!(loaded, blob);
    }
}
