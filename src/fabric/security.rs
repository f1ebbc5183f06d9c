//! Secure envelope: canonical-JSON HMAC-SHA256 signing plus
//! ChaCha20-Poly1305 encryption of the message content.
//!
//! The system this replaces used base64 as a placeholder "encryption" —
//! trivially reversible by anyone, not an encryption scheme at all. This
//! module is the real thing: the content is sealed with an AEAD cipher
//! under a random nonce, and the envelope is authenticated separately
//! with HMAC so tampering with either the ciphertext or the metadata is
//! detectable.

use crate::constants::{SECURE_ENVELOPE_NONCE_LEN, SECURITY_KEY_LEN};
use crate::error::AwcpError;
use crate::models::AgentId;
use crate::Result;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::collections::{BTreeMap, HashMap, HashSet};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

use super::Message;

#[derive(Default)]
pub struct SecurityState {
    enabled: bool,
    encryption_key: Option<Vec<u8>>,
    auth_keys: HashMap<AgentId, Vec<u8>>,
    authorized_senders: HashSet<AgentId>,
}

impl SecurityState {
    pub fn enable(&mut self, encryption_key: Option<Vec<u8>>) -> Result<()> {
        let key = match encryption_key {
            Some(k) if k.len() == SECURITY_KEY_LEN => k,
            Some(k) => {
                return Err(AwcpError::invalid(format!(
                    "encryption key must be {SECURITY_KEY_LEN} bytes, got {}",
                    k.len()
                )))
            }
            None => {
                let mut key = vec![0u8; SECURITY_KEY_LEN];
                rand::thread_rng().fill_bytes(&mut key);
                key
            }
        };
        self.encryption_key = Some(key);
        self.enabled = true;
        Ok(())
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.encryption_key = None;
    }

    pub fn register_auth_key(&mut self, agent_id: AgentId, auth_key: Vec<u8>) {
        self.auth_keys.insert(agent_id, auth_key);
    }

    pub fn authorize(&mut self, sender_id: AgentId) {
        self.authorized_senders.insert(sender_id);
    }

    pub fn revoke(&mut self, sender_id: &AgentId) {
        self.authorized_senders.remove(sender_id);
    }

    pub fn is_authorized(&self, sender_id: &AgentId) -> bool {
        self.authorized_senders.contains(sender_id)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Builds the inner envelope — sender/recipient/type/content plus an
    /// HMAC signature over that same tuple — then encrypts the whole
    /// thing under the fabric's shared encryption key. The signature
    /// travels inside the ciphertext, not beside it, so tampering with
    /// the outer envelope can't separate a valid signature from forged
    /// content. Returns the new `content` value to install on the
    /// message: `{ciphertext, nonce}`.
    pub fn seal(&self, message: &mut Message, auth_key: &[u8]) -> Result<serde_json::Value> {
        let inner = serde_json::json!({
            "sender_id": message.sender_id,
            "recipient": message.recipient,
            "message_type": message.message_type,
            "content": message.content,
        });
        let signature = sign(&inner, auth_key);
        let mut signed_inner = inner;
        signed_inner["signature"] = serde_json::json!(signature);

        let enc_key = self
            .encryption_key
            .as_ref()
            .ok_or_else(|| AwcpError::invalid("security is not enabled on this fabric"))?;

        let mut nonce_bytes = [0u8; SECURE_ENVELOPE_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(enc_key));
        let nonce = Nonce::from_slice(&nonce_bytes);
        let plaintext = serde_json::to_vec(&signed_inner)?;
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|_| AwcpError::Integrity("encryption failure".to_string()))?;

        Ok(serde_json::json!({
            "ciphertext": base64_encode(&ciphertext),
            "nonce": base64_encode(&nonce_bytes),
        }))
    }

    /// Reverses `seal`: resolves the verification key from the sender's
    /// registered auth key — never from a caller-supplied key, which would
    /// let any holder of any key "verify" on behalf of any sender — then
    /// decrypts the ciphertext, verifies the recovered HMAC signature in
    /// constant time, and checks that the decrypted envelope's own
    /// `sender_id` matches the transport message's claimed sender. Any
    /// mismatch is an `Integrity` error.
    pub fn open(&self, message: &Message) -> Result<serde_json::Value> {
        let sender_id = message
            .sender_id
            .as_ref()
            .ok_or_else(|| AwcpError::Integrity("secure message has no sender_id".to_string()))?;
        let auth_key = self
            .auth_keys
            .get(sender_id)
            .ok_or_else(|| AwcpError::Integrity(format!("no registered auth key for sender {sender_id}")))?;

        let envelope = message
            .content
            .as_object()
            .ok_or_else(|| AwcpError::Integrity("secure envelope is not an object".to_string()))?;

        let enc_key = self
            .encryption_key
            .as_ref()
            .ok_or_else(|| AwcpError::invalid("security is not enabled on this fabric"))?;
        let ciphertext = envelope
            .get("ciphertext")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AwcpError::Integrity("secure envelope missing ciphertext".to_string()))?;
        let nonce_b64 = envelope
            .get("nonce")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AwcpError::Integrity("secure envelope missing nonce".to_string()))?;

        let ciphertext = base64_decode(ciphertext)?;
        let nonce_bytes = base64_decode(nonce_b64)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(enc_key));
        let nonce = Nonce::from_slice(&nonce_bytes);
        let plaintext = cipher
            .decrypt(nonce, ciphertext.as_ref())
            .map_err(|_| AwcpError::Integrity("decryption failure".to_string()))?;

        let mut signed_inner: serde_json::Value = serde_json::from_slice(&plaintext)?;
        let signature = signed_inner
            .as_object_mut()
            .and_then(|m| m.remove("signature"))
            .and_then(|v| v.as_str().map(String::from))
            .ok_or_else(|| AwcpError::Integrity("decrypted envelope missing signature".to_string()))?;

        let expected = sign(&signed_inner, auth_key);
        if !bool::from(signature.as_bytes().ct_eq(expected.as_bytes())) {
            return Err(AwcpError::Integrity("signature mismatch".to_string()));
        }

        let claimed_sender = signed_inner.get("sender_id").and_then(|v| v.as_str());
        if claimed_sender != Some(sender_id.as_str()) {
            return Err(AwcpError::Integrity(
                "envelope sender_id does not match the transport message's sender".to_string(),
            ));
        }

        signed_inner
            .as_object()
            .and_then(|m| m.get("content").cloned())
            .ok_or_else(|| AwcpError::Integrity("decrypted envelope missing content".to_string()))
    }
}

/// HMAC-SHA256 over the canonical JSON of `payload`.
fn sign(payload: &serde_json::Value, auth_key: &[u8]) -> String {
    let canonical = canonical_json(payload);
    let mut mac = HmacSha256::new_from_slice(auth_key).expect("HMAC accepts any key length");
    mac.update(canonical.as_bytes());
    hex_encode(&mac.finalize().into_bytes())
}

/// Recursively sorts object keys so that two semantically-equal JSON
/// values always serialize to the same byte string, independent of
/// insertion order.
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn sorted(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let sorted_map: BTreeMap<String, serde_json::Value> =
                    map.iter().map(|(k, v)| (k.clone(), sorted(v))).collect();
                serde_json::Value::Object(sorted_map.into_iter().collect())
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sorted).collect())
            }
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn base64_decode(s: &str) -> Result<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| AwcpError::Integrity(format!("invalid base64 in secure envelope: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_json_ignores_key_order() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn seal_then_open_recovers_content() {
        let mut state = SecurityState::default();
        state.enable(Some(vec![7u8; SECURITY_KEY_LEN])).unwrap();
        let auth_key = b"shared-secret";
        state.register_auth_key("agent-a".to_string(), auth_key.to_vec());

        let mut message = Message::new(
            "agent-b",
            "secure_message",
            serde_json::json!({"x": 1}),
            Some("agent-a".to_string()),
        );
        let sealed = state.seal(&mut message, auth_key).unwrap();
        message.content = sealed;

        let opened = state.open(&message).unwrap();
        assert_eq!(opened, serde_json::json!({"x": 1}));
    }

    #[test]
    fn open_rejects_unregistered_sender() {
        let mut state = SecurityState::default();
        state.enable(Some(vec![7u8; SECURITY_KEY_LEN])).unwrap();
        let auth_key = b"shared-secret";

        let mut message = Message::new(
            "agent-b",
            "secure_message",
            serde_json::json!({"x": 1}),
            Some("agent-a".to_string()),
        );
        let sealed = state.seal(&mut message, auth_key).unwrap();
        message.content = sealed;

        assert!(state.open(&message).is_err(), "no auth key registered for agent-a");
    }

    #[test]
    fn open_rejects_sender_id_spoofed_at_the_transport_layer() {
        let mut state = SecurityState::default();
        state.enable(Some(vec![7u8; SECURITY_KEY_LEN])).unwrap();
        let auth_key = b"shared-secret";
        state.register_auth_key("agent-a".to_string(), auth_key.to_vec());
        state.register_auth_key("agent-x".to_string(), auth_key.to_vec());

        let mut message = Message::new(
            "agent-b",
            "secure_message",
            serde_json::json!({"x": 1}),
            Some("agent-a".to_string()),
        );
        let sealed = state.seal(&mut message, auth_key).unwrap();
        message.content = sealed;
        message.sender_id = Some("agent-x".to_string());

        assert!(state.open(&message).is_err(), "transport sender must match the envelope's own sender_id");
    }

    #[test]
    fn tampered_ciphertext_fails_integrity_check() {
        let mut state = SecurityState::default();
        state.enable(Some(vec![7u8; SECURITY_KEY_LEN])).unwrap();
        let auth_key = b"shared-secret";
        state.register_auth_key("agent-a".to_string(), auth_key.to_vec());

        let mut message = Message::new(
            "agent-b",
            "secure_message",
            serde_json::json!({"x": 1}),
            Some("agent-a".to_string()),
        );
        let mut sealed = state.seal(&mut message, auth_key).unwrap();
        sealed["ciphertext"] = serde_json::json!("AAAA");
        message.content = sealed;

        assert!(state.open(&message).is_err());
    }
}
