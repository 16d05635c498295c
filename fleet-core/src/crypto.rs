//! AES-256-GCM payload envelopes and HMAC-SHA256 record signing.
//!
//! Mirrors the two original crypto layers: `encryption.py` (per-payload
//! end-to-end envelope) and `cluster_security.py` (cluster node/heartbeat
//! signing, key derivation).

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;

use crate::CoreError;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const CLUSTER_HKDF_SALT: &[u8] = b"cluster-encryption-v1";
const PBKDF2_ITERATIONS: u32 = 100_000;
const PBKDF2_SALT_LEN: usize = 16;

/// An AES-256-GCM encrypted JSON payload, as carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub encrypted: bool,
    pub version: String,
    pub nonce: String,
    pub ciphertext: String,
}

/// Generate a new random 256-bit key, base64-encoded, suitable for
/// `encrypt_payload`/`decrypt_payload`.
pub fn generate_envelope_key() -> String {
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    B64.encode(key)
}

/// Derive a 256-bit key and its salt from a password via PBKDF2-HMAC-SHA256
/// (100,000 iterations). Returns (base64_key, base64_salt).
pub fn derive_key_from_password(password: &str, salt: Option<&[u8]>) -> (String, String) {
    let owned_salt;
    let salt_bytes: &[u8] = match salt {
        Some(s) => s,
        None => {
            let mut s = vec![0u8; PBKDF2_SALT_LEN];
            rand::thread_rng().fill_bytes(&mut s);
            owned_salt = s;
            &owned_salt
        }
    };
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt_bytes, PBKDF2_ITERATIONS, &mut key);
    (B64.encode(key), B64.encode(salt_bytes))
}

fn load_key(key_b64: &str) -> Result<Aes256Gcm, CoreError> {
    let raw = B64
        .decode(key_b64)
        .map_err(|_| CoreError::InvalidKey("encryption key is not valid base64".into()))?;
    if raw.len() != KEY_LEN {
        return Err(CoreError::InvalidKey(format!(
            "invalid key length: {} bytes (expected {})",
            raw.len(),
            KEY_LEN
        )));
    }
    let key = Key::<Aes256Gcm>::from_slice(&raw);
    Ok(Aes256Gcm::new(key))
}

/// Encrypt a JSON value into an [`Envelope`].
pub fn encrypt_payload(key_b64: &str, data: &serde_json::Value) -> Result<Envelope, CoreError> {
    let cipher = load_key(key_b64)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let plaintext = serde_json::to_vec(data).map_err(|e| CoreError::Serialization(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_ref())
        .map_err(|_| CoreError::Crypto("encryption failed".into()))?;

    Ok(Envelope {
        encrypted: true,
        version: "1".to_string(),
        nonce: B64.encode(nonce_bytes),
        ciphertext: B64.encode(ciphertext),
    })
}

/// Decrypt an [`Envelope`] back into a JSON value.
pub fn decrypt_payload(key_b64: &str, envelope: &Envelope) -> Result<serde_json::Value, CoreError> {
    let cipher = load_key(key_b64)?;
    let nonce_bytes = B64
        .decode(&envelope.nonce)
        .map_err(|_| CoreError::Crypto("invalid nonce encoding".into()))?;
    let ciphertext = B64
        .decode(&envelope.ciphertext)
        .map_err(|_| CoreError::Crypto("invalid ciphertext encoding".into()))?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext.as_ref())
        .map_err(|_| CoreError::Crypto("failed to decrypt payload".into()))?;

    serde_json::from_slice(&plaintext).map_err(|e| CoreError::Serialization(e.to_string()))
}

/// Shared-secret authentication and signing for cluster node traffic.
pub struct ClusterSecurity {
    secret: Vec<u8>,
}

type HmacSha256 = Hmac<Sha256>;

impl ClusterSecurity {
    /// `cluster_secret` is base64-encoded and must decode to at least 32
    /// bytes (256 bits).
    pub fn new(cluster_secret: &str) -> Result<Self, CoreError> {
        let secret = B64
            .decode(cluster_secret)
            .map_err(|_| CoreError::InvalidKey("cluster secret is not valid base64".into()))?;
        if secret.len() < KEY_LEN {
            return Err(CoreError::InvalidKey(format!(
                "cluster secret too short ({} bytes). Minimum {} bytes required for security.",
                secret.len(),
                KEY_LEN
            )));
        }
        Ok(Self { secret })
    }

    /// Derive a 32-byte AES key from the cluster secret via HKDF-SHA256.
    pub fn derive_encryption_key(&self) -> [u8; KEY_LEN] {
        let hk = Hkdf::<Sha256>::new(Some(CLUSTER_HKDF_SALT), &self.secret);
        let mut out = [0u8; KEY_LEN];
        hk.expand(b"", &mut out)
            .expect("32 bytes is a valid HKDF-SHA256 output length");
        out
    }

    fn canonical_json(value: &serde_json::Map<String, serde_json::Value>) -> String {
        let sorted: BTreeMap<&String, &serde_json::Value> = value.iter().collect();
        let mut out = String::from("{");
        for (i, (k, v)) in sorted.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&serde_json::to_string(k).expect("string keys always serialize"));
            out.push(':');
            out.push_str(&serde_json::to_string(v).expect("json values always serialize"));
        }
        out.push('}');
        out
    }

    fn hmac(&self, canonical: &str) -> Vec<u8> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC accepts keys of any length");
        mac.update(canonical.as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    /// Sign an arbitrary JSON object, adding `_timestamp`, `_security_version`
    /// and `_signature` fields computed over the canonical (sorted-key)
    /// encoding of everything else.
    pub fn sign_record(
        &self,
        record: &serde_json::Map<String, serde_json::Value>,
        now: i64,
    ) -> serde_json::Map<String, serde_json::Value> {
        let mut signed = record.clone();
        signed.insert("_timestamp".into(), serde_json::json!(now));
        signed.insert("_security_version".into(), serde_json::json!("1.0"));

        let canonical = Self::canonical_json(&signed);
        let signature = self.hmac(&canonical);
        signed.insert("_signature".into(), serde_json::json!(B64.encode(signature)));
        signed
    }

    /// Verify a signed record's signature and timestamp freshness.
    pub fn verify_record(
        &self,
        signed: &serde_json::Map<String, serde_json::Value>,
        max_age_seconds: i64,
        now: i64,
    ) -> Result<(), String> {
        let provided_sig = signed
            .get("_signature")
            .and_then(|v| v.as_str())
            .ok_or("Missing signature")?;
        let timestamp = signed
            .get("_timestamp")
            .and_then(|v| v.as_i64())
            .ok_or("Missing timestamp")?;

        let mut unsigned = signed.clone();
        unsigned.remove("_signature");
        let canonical = Self::canonical_json(&unsigned);
        let expected = B64.encode(self.hmac(&canonical));

        use subtle_compare::ct_eq;
        if !ct_eq(provided_sig.as_bytes(), expected.as_bytes()) {
            return Err("Invalid signature - node authentication failed".to_string());
        }

        let age = now - timestamp;
        if age < 0 {
            return Err("Timestamp is in the future".to_string());
        }
        if age > max_age_seconds {
            return Err(format!("Timestamp too old ({age}s > {max_age_seconds}s)"));
        }
        Ok(())
    }

    /// Sign a heartbeat record (node_id, timestamp, type=heartbeat).
    pub fn sign_heartbeat(&self, node_id: &str, now: i64) -> serde_json::Map<String, serde_json::Value> {
        let mut record = serde_json::Map::new();
        record.insert("node_id".into(), serde_json::json!(node_id));
        record.insert("timestamp".into(), serde_json::json!(now));
        record.insert("type".into(), serde_json::json!("heartbeat"));
        self.sign_record(&record, now)
    }

    /// Heartbeats use a tighter 30 second replay window; node records use
    /// the caller-supplied window (300s at the call sites in `backend`).
    pub const HEARTBEAT_MAX_AGE_SECONDS: i64 = 30;
    pub const NODE_RECORD_MAX_AGE_SECONDS: i64 = 300;
}

/// Generate a new random cluster secret (256 bits, base64-encoded).
pub fn generate_cluster_secret() -> String {
    generate_envelope_key()
}

/// Minimal constant-time byte comparison, since `subtle` is not in the
/// dependency set; kept local and tiny rather than pulled in as a crate.
mod subtle_compare {
    pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
        if a.len() != b.len() {
            return false;
        }
        let mut diff = 0u8;
        for (x, y) in a.iter().zip(b.iter()) {
            diff |= x ^ y;
        }
        diff == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let key = generate_envelope_key();
        let data = serde_json::json!({"cpu": 12.5, "host": "box-1"});
        let envelope = encrypt_payload(&key, &data).unwrap();
        assert!(envelope.encrypted);
        let decrypted = decrypt_payload(&key, &envelope).unwrap();
        assert_eq!(decrypted, data);
    }

    #[test]
    fn envelope_rejects_wrong_key() {
        let key = generate_envelope_key();
        let other = generate_envelope_key();
        let envelope = encrypt_payload(&key, &serde_json::json!({"a": 1})).unwrap();
        assert!(decrypt_payload(&other, &envelope).is_err());
    }

    #[test]
    fn password_derivation_is_deterministic_given_salt() {
        let (key1, salt) = derive_key_from_password("correct horse battery staple", None);
        let (key2, _) = derive_key_from_password(
            "correct horse battery staple",
            Some(&B64.decode(&salt).unwrap()),
        );
        assert_eq!(key1, key2);
    }

    #[test]
    fn cluster_secret_too_short_is_rejected() {
        let short = B64.encode([0u8; 16]);
        assert!(ClusterSecurity::new(&short).is_err());
    }

    #[test]
    fn record_sign_and_verify_round_trip() {
        let secret = generate_cluster_secret();
        let sec = ClusterSecurity::new(&secret).unwrap();
        let mut record = serde_json::Map::new();
        record.insert("node_id".into(), serde_json::json!("node-a"));
        let now = 1_700_000_000;
        let signed = sec.sign_record(&record, now);
        assert!(sec.verify_record(&signed, 300, now + 10).is_ok());
    }

    #[test]
    fn record_verify_rejects_stale_timestamp() {
        let secret = generate_cluster_secret();
        let sec = ClusterSecurity::new(&secret).unwrap();
        let mut record = serde_json::Map::new();
        record.insert("node_id".into(), serde_json::json!("node-a"));
        let now = 1_700_000_000;
        let signed = sec.sign_record(&record, now);
        assert!(sec.verify_record(&signed, 300, now + 301).is_err());
    }

    #[test]
    fn record_verify_rejects_tampering() {
        let secret = generate_cluster_secret();
        let sec = ClusterSecurity::new(&secret).unwrap();
        let mut record = serde_json::Map::new();
        record.insert("node_id".into(), serde_json::json!("node-a"));
        let now = 1_700_000_000;
        let mut signed = sec.sign_record(&record, now);
        signed.insert("node_id".into(), serde_json::json!("node-b"));
        assert!(sec.verify_record(&signed, 300, now + 1).is_err());
    }

    #[test]
    fn heartbeat_uses_tight_replay_window() {
        let secret = generate_cluster_secret();
        let sec = ClusterSecurity::new(&secret).unwrap();
        let now = 1_700_000_000;
        let hb = sec.sign_heartbeat("node-a", now);
        assert!(sec
            .verify_record(&hb, ClusterSecurity::HEARTBEAT_MAX_AGE_SECONDS, now + 31)
            .is_err());
        assert!(sec
            .verify_record(&hb, ClusterSecurity::HEARTBEAT_MAX_AGE_SECONDS, now + 5)
            .is_ok());
    }
}
