//! Encrypted payload containers.
//!
//! Container layout:
//!
//! ```text
//! "ACE1" | salt (16) | nonce (12) | ChaCha20-Poly1305 ciphertext + tag
//! ```
//!
//! The key is derived from the host-supplied password with Argon2id over the
//! salt. Containers are only opened after the signature over the container
//! bytes has been verified.

use std::io::Write;
use std::path::Path;

use argon2::Argon2;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use tempfile::NamedTempFile;
use zeroize::Zeroizing;

use crate::error::DecryptionError;

/// Magic bytes identifying an encrypted payload container.
const CONTAINER_MAGIC: &[u8; 4] = b"ACE1";
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = CONTAINER_MAGIC.len() + SALT_LEN + NONCE_LEN;

fn derive_key(password: &str, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>, DecryptionError> {
    let mut key = Zeroizing::new([0u8; 32]);
    Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut key[..])
        .map_err(|e| DecryptionError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

/// Open a container held in memory.
pub fn open(container: &[u8], password: &str) -> Result<Vec<u8>, DecryptionError> {
    if container.len() < HEADER_LEN {
        return Err(DecryptionError::Malformed(format!(
            "container is {} bytes, header needs {}",
            container.len(),
            HEADER_LEN
        )));
    }
    let (magic, rest) = container.split_at(CONTAINER_MAGIC.len());
    if magic != CONTAINER_MAGIC {
        return Err(DecryptionError::Malformed("bad magic".to_string()));
    }
    let (salt, rest) = rest.split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

    let key = derive_key(password, salt)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| DecryptionError::AuthenticationFailed)
}

/// Seal `plaintext` into a container with a fresh salt and nonce.
pub fn seal(plaintext: &[u8], password: &str) -> Result<Vec<u8>, DecryptionError> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    getrandom::getrandom(&mut salt).map_err(|_| DecryptionError::EncryptionFailed)?;
    getrandom::getrandom(&mut nonce).map_err(|_| DecryptionError::EncryptionFailed)?;

    let key = derive_key(password, &salt)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| DecryptionError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    out.extend_from_slice(CONTAINER_MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a verified container file into a new temp file in `staging_dir`.
///
/// The caller keeps ownership of the source file and drops it afterwards.
pub async fn open_file(
    path: &Path,
    password: Option<&str>,
    staging_dir: &Path,
) -> Result<NamedTempFile, DecryptionError> {
    let password = password.ok_or(DecryptionError::PasswordUnavailable)?;
    let container = tokio::fs::read(path).await?;

    let plaintext = tokio::task::spawn_blocking({
        let password = Zeroizing::new(password.to_string());
        move || open(&container, &password)
    })
    .await
    .map_err(|e| DecryptionError::Io(std::io::Error::other(e)))??;

    let mut out = NamedTempFile::new_in(staging_dir)?;
    out.write_all(&plaintext)?;
    out.as_file().sync_all()?;
    tracing::debug!(
        source = %path.display(),
        bytes = plaintext.len(),
        "Decrypted payload container"
    );
    Ok(out)
}
