use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{anyhow, Context, Result};
use rand::RngCore;
use sha2::{Digest, Sha256};

const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;

/// Derives the AES-256 key from a process-wide secret the same way the
/// field-encryption format on the wire expects: `SHA-256(secret)`.
#[derive(Clone)]
pub struct EncryptionKey(Key<Aes256Gcm>);

impl EncryptionKey {
    pub fn from_secret(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        Self(*Key::<Aes256Gcm>::from_slice(&digest))
    }
}

/// Encrypts `plaintext`, returning `ivHex:authTagHex:cipherHex`.
///
/// AES-GCM in this crate ships ciphertext and tag concatenated; we split
/// them back apart to match the three-part wire format.
pub fn encrypt(key: &EncryptionKey, plaintext: &str) -> Result<String> {
    let cipher = Aes256Gcm::new(&key.0);
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    let nonce = Nonce::from_slice(&iv[..12]);

    let mut out = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| anyhow!("encryption failed: {e}"))?;
    let tag = out.split_off(out.len() - TAG_LEN);

    Ok(format!(
        "{}:{}:{}",
        hex::encode(iv),
        hex::encode(tag),
        hex::encode(out)
    ))
}

/// Decrypts a field in the `ivHex:authTagHex:cipherHex` format.
pub fn decrypt(key: &EncryptionKey, encoded: &str) -> Result<String> {
    let parts: Vec<&str> = encoded.split(':').collect();
    let [iv_hex, tag_hex, cipher_hex] = parts[..] else {
        return Err(anyhow!("malformed credential encoding"));
    };

    let iv = hex::decode(iv_hex).context("invalid iv hex")?;
    let tag = hex::decode(tag_hex).context("invalid auth tag hex")?;
    let ciphertext = hex::decode(cipher_hex).context("invalid ciphertext hex")?;
    if iv.len() != IV_LEN || tag.len() != TAG_LEN {
        return Err(anyhow!("credential encoding has wrong component lengths"));
    }

    let cipher = Aes256Gcm::new(&key.0);
    let nonce = Nonce::from_slice(&iv[..12]);

    let mut combined = ciphertext;
    combined.extend_from_slice(&tag);

    let plaintext = cipher
        .decrypt(nonce, combined.as_slice())
        .map_err(|e| anyhow!("decryption failed: {e}"))?;

    String::from_utf8(plaintext).context("decrypted credential was not valid utf-8")
}

/// Whether a stored field looks like an encrypted value per the three-part
/// `ivHex(32):authTagHex(32):cipherHex(even)` shape.
pub fn looks_encrypted(value: &str) -> bool {
    let parts: Vec<&str> = value.split(':').collect();
    let [iv_hex, tag_hex, cipher_hex] = parts[..] else {
        return false;
    };
    iv_hex.len() == IV_LEN * 2
        && tag_hex.len() == TAG_LEN * 2
        && !cipher_hex.is_empty()
        && cipher_hex.len() % 2 == 0
        && [iv_hex, tag_hex, cipher_hex]
            .iter()
            .all(|s| s.bytes().all(|b| b.is_ascii_hexdigit()))
}

/// SHA-256 of a bundle token, hex-encoded, as stored for lookup.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Constant-time string comparison for the wildcard-token check.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_credential() {
        let key = EncryptionKey::from_secret("process-secret");
        let encoded = encrypt(&key, "sk-super-secret").unwrap();
        assert!(looks_encrypted(&encoded));
        assert_eq!(decrypt(&key, &encoded).unwrap(), "sk-super-secret");
    }

    #[test]
    fn rejects_malformed_encoding() {
        let key = EncryptionKey::from_secret("process-secret");
        assert!(decrypt(&key, "not-encrypted").is_err());
        assert!(!looks_encrypted("not-encrypted"));
    }

    #[test]
    fn constant_time_eq_matches_equal_strings() {
        assert!(constant_time_eq("mcpb_abc", "mcpb_abc"));
        assert!(!constant_time_eq("mcpb_abc", "mcpb_abd"));
        assert!(!constant_time_eq("short", "longer"));
    }
}
