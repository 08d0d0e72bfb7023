// hommss-backup/src/backup/encryption.rs
//! AES-256-CBC artifact encryption.
//!
//! Written format: `HMSENC2\0 | salt(16) | iv(16) | ciphertext | hmac(32)`.
//! The cipher and MAC keys are both derived from the password with
//! PBKDF2-HMAC-SHA256 over the salt, and the MAC covers everything before it.
//!
//! Artifacts from the older backup scripts are base64 text encrypted with
//! the zero-padded password as key and an IV of sixteen ASCII `'0'`s. They
//! can still be decrypted but are never written.

use aes::Aes256;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{BackupError, DecryptionError, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

pub const MAGIC: &[u8; 8] = b"HMSENC2\0";
pub const PBKDF2_ROUNDS: u32 = 100_000;
const SALT_LEN: usize = 16;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 32;
const HEADER_LEN: usize = MAGIC.len() + SALT_LEN + IV_LEN;
const LEGACY_IV: &[u8; IV_LEN] = b"0000000000000000";

struct DerivedKeys {
    cipher: [u8; 32],
    mac: [u8; 32],
}

fn derive_keys(password: &str, salt: &[u8]) -> DerivedKeys {
    let mut material = [0u8; 64];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut material);
    let mut keys = DerivedKeys { cipher: [0u8; 32], mac: [0u8; 32] };
    keys.cipher.copy_from_slice(&material[..32]);
    keys.mac.copy_from_slice(&material[32..]);
    keys
}

fn check_password(password: &str) -> Result<()> {
    if password.is_empty() {
        return Err(BackupError::Configuration(
            "encryption password must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn mac_for(key: &[u8], data: &[u8]) -> Result<HmacSha256> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| BackupError::Encryption(format!("invalid MAC key: {e}")))?;
    mac.update(data);
    Ok(mac)
}

pub fn encrypt(plaintext: &[u8], password: &str) -> Result<Vec<u8>> {
    check_password(password)?;

    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut iv);
    let keys = derive_keys(password, &salt);

    let ciphertext = Aes256CbcEnc::new_from_slices(&keys.cipher, &iv)
        .map_err(|e| BackupError::Encryption(e.to_string()))?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len() + TAG_LEN);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    let tag = mac_for(&keys.mac, &out)?.finalize().into_bytes();
    out.extend_from_slice(&tag);
    Ok(out)
}

/// Decrypts either format. A wrong password is always reported as
/// `WrongPassword` for the current format; the legacy format can only detect
/// it through invalid padding.
pub fn decrypt(data: &[u8], password: &str) -> Result<Vec<u8>> {
    check_password(password)?;
    if data.starts_with(MAGIC) {
        decrypt_current(data, password)
    } else {
        decrypt_legacy(data, password)
    }
}

fn decrypt_current(data: &[u8], password: &str) -> Result<Vec<u8>> {
    if data.len() < HEADER_LEN + IV_LEN + TAG_LEN {
        return Err(DecryptionError::Corrupt(format!("encrypted data is truncated ({} bytes)", data.len())).into());
    }
    let (body, tag) = data.split_at(data.len() - TAG_LEN);
    let salt = &body[MAGIC.len()..MAGIC.len() + SALT_LEN];
    let iv = &body[MAGIC.len() + SALT_LEN..HEADER_LEN];
    let ciphertext = &body[HEADER_LEN..];
    if ciphertext.len() % IV_LEN != 0 {
        return Err(DecryptionError::Corrupt("ciphertext is not a whole number of blocks".to_string()).into());
    }

    let keys = derive_keys(password, salt);
    mac_for(&keys.mac, body)?
        .verify_slice(tag)
        .map_err(|_| DecryptionError::WrongPassword)?;

    Aes256CbcDec::new_from_slices(&keys.cipher, iv)
        .map_err(|e| BackupError::Encryption(e.to_string()))?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| DecryptionError::Corrupt("invalid padding after MAC check".to_string()).into())
}

fn decrypt_legacy(data: &[u8], password: &str) -> Result<Vec<u8>> {
    let text: Vec<u8> = data.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
    let ciphertext = STANDARD
        .decode(&text)
        .map_err(|e| DecryptionError::Corrupt(format!("not a recognised encrypted artifact: {e}")))?;
    if ciphertext.is_empty() || ciphertext.len() % IV_LEN != 0 {
        return Err(DecryptionError::Corrupt("ciphertext is not a whole number of blocks".to_string()).into());
    }

    let mut key = [0u8; 32];
    let bytes = password.as_bytes();
    let n = bytes.len().min(key.len());
    key[..n].copy_from_slice(&bytes[..n]);

    Aes256CbcDec::new_from_slices(&key, LEGACY_IV)
        .map_err(|e| BackupError::Encryption(e.to_string()))?
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| DecryptionError::WrongPassword.into())
}

/// Path with `.enc` appended to the full file name.
pub fn encrypted_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".enc");
    PathBuf::from(name)
}

/// Encrypts `path` into `<path>.enc` and removes the plaintext.
pub fn encrypt_file(path: &Path, password: &str) -> Result<PathBuf> {
    let plaintext = fs::read(path)?;
    let encrypted = encrypt(&plaintext, password)?;
    let out = encrypted_path(path);
    fs::write(&out, encrypted)?;
    fs::remove_file(path)?;
    tracing::info!("🔒 Encrypted {} -> {}", path.display(), out.display());
    Ok(out)
}

/// Decrypts `path` into `output`, defaulting to the path without `.enc`.
pub fn decrypt_file(path: &Path, password: &str, output: Option<&Path>) -> Result<PathBuf> {
    let out = match output {
        Some(p) => p.to_path_buf(),
        None => {
            let name = path.to_string_lossy();
            match name.strip_suffix(".enc") {
                Some(stripped) => PathBuf::from(stripped),
                None => PathBuf::from(format!("{name}.dec")),
            }
        }
    };
    let data = fs::read(path)?;
    let plaintext = decrypt(&data, password)?;
    fs::write(&out, plaintext)?;
    tracing::info!("🔓 Decrypted {} -> {}", path.display(), out.display());
    Ok(out)
}
