//! AES-256-GCM encrypted secrets store.
//!
//! # File format
//! ```text
//! [8 bytes:  magic "POLSECRT"]
//! [1 byte:   version = 0x01]
//! [16 bytes: salt]               ← bound as additional authenticated data
//! [12 bytes: nonce]
//! [N bytes:  ciphertext + 16-byte GCM tag]
//! ```
//!
//! The master key is a raw 32-byte blob stored in a separate file with
//! mode 0600. Secret values never appear in logs; `list` returns names
//! only.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;

const MAGIC: &[u8; 8] = b"POLSECRT";
const VERSION: u8 = 0x01;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const HEADER_LEN: usize = MAGIC.len() + 1 + SALT_LEN + NONCE_LEN;

#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("key file must be exactly {KEY_LEN} bytes, got {0}")]
    BadKeyLength(usize),
    #[error("invalid secrets file (bad magic)")]
    BadMagic,
    #[error("unsupported secrets file version: {0}")]
    UnsupportedVersion(u8),
    #[error("secrets file is truncated")]
    Truncated,
    #[error("decryption failed (wrong key or corrupted file)")]
    Decrypt,
    #[error("encryption failed")]
    Encrypt,
    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),
}

type SecretStore = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Create an empty encrypted secrets file; the key file is created too
/// if it does not exist yet.
pub fn init_secrets(output: &Path, key_file: &Path) -> Result<(), SecretsError> {
    ensure_key_file(key_file)?;
    let key = load_key(key_file)?;
    encrypt_store(output, &key, &SecretStore::new())
}

/// Add or update a single secret in the encrypted store.
pub fn set_secret(
    secrets_file: &Path,
    key_file: &Path,
    name: &str,
    value: &str,
) -> Result<(), SecretsError> {
    let key = load_key(key_file)?;
    let mut store = decrypt_store(secrets_file, &key)?;
    store.insert(name.to_owned(), value.to_owned());
    encrypt_store(secrets_file, &key, &store)
}

/// The names (never the values) of all stored secrets, sorted.
pub fn list_secrets(secrets_file: &Path, key_file: &Path) -> Result<Vec<String>, SecretsError> {
    let key = load_key(key_file)?;
    Ok(decrypt_store(secrets_file, &key)?.into_keys().collect())
}

/// Decrypt and return the full secrets map.
pub fn load_secrets(
    secrets_file: &Path,
    key_file: &Path,
) -> Result<HashMap<String, String>, SecretsError> {
    let key = load_key(key_file)?;
    Ok(decrypt_store(secrets_file, &key)?.into_iter().collect())
}

/// Re-encrypt the store with a new key, creating the new key file if
/// needed.
pub fn rekey(
    secrets_file: &Path,
    old_key_file: &Path,
    new_key_file: &Path,
) -> Result<(), SecretsError> {
    let old_key = load_key(old_key_file)?;
    let store = decrypt_store(secrets_file, &old_key)?;
    ensure_key_file(new_key_file)?;
    let new_key = load_key(new_key_file)?;
    encrypt_store(secrets_file, &new_key, &store)
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn ensure_key_file(key_file: &Path) -> Result<(), SecretsError> {
    if key_file.exists() {
        return Ok(());
    }
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    fs::write(key_file, key)?;
    restrict_mode(key_file)?;
    Ok(())
}

fn load_key(key_file: &Path) -> Result<Vec<u8>, SecretsError> {
    let key = fs::read(key_file)?;
    if key.len() != KEY_LEN {
        return Err(SecretsError::BadKeyLength(key.len()));
    }
    Ok(key)
}

fn encrypt_store(path: &Path, key: &[u8], store: &SecretStore) -> Result<(), SecretsError> {
    let plaintext = serde_json::to_vec(store)?;
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    let mut rng = rand::thread_rng();
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| SecretsError::BadKeyLength(key.len()))?;
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &plaintext,
                aad: &salt,
            },
        )
        .map_err(|_| SecretsError::Encrypt)?;

    let mut data = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    data.extend_from_slice(MAGIC);
    data.push(VERSION);
    data.extend_from_slice(&salt);
    data.extend_from_slice(&nonce);
    data.extend_from_slice(&ciphertext);
    fs::write(path, data)?;
    restrict_mode(path)?;
    Ok(())
}

fn decrypt_store(path: &Path, key: &[u8]) -> Result<SecretStore, SecretsError> {
    let data = fs::read(path)?;
    if data.len() < HEADER_LEN {
        if data.len() < MAGIC.len() || &data[..MAGIC.len()] != MAGIC {
            return Err(SecretsError::BadMagic);
        }
        return Err(SecretsError::Truncated);
    }
    if &data[..MAGIC.len()] != MAGIC {
        return Err(SecretsError::BadMagic);
    }
    let version = data[MAGIC.len()];
    if version != VERSION {
        return Err(SecretsError::UnsupportedVersion(version));
    }

    let salt = &data[MAGIC.len() + 1..MAGIC.len() + 1 + SALT_LEN];
    let nonce = &data[MAGIC.len() + 1 + SALT_LEN..HEADER_LEN];
    let ciphertext = &data[HEADER_LEN..];

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| SecretsError::BadKeyLength(key.len()))?;
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: salt,
            },
        )
        .map_err(|_| SecretsError::Decrypt)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

#[cfg(unix)]
fn restrict_mode(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_mode(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
