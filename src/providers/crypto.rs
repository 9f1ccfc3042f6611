//! Signature helpers shared by the gateway adapters
//!
//! - RSA-SHA256 (PKCS#1 v1.5): WeChat Pay v3, Alipay RSA2
//! - HMAC-SHA256 hex: Stripe, Paddle webhooks

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Signing failed: {0}")]
    Signing(String),
}

/// Accept a PEM block (SPKI or PKCS#1) or a bare base64 DER body
pub fn parse_public_key(key: &str) -> Result<RsaPublicKey, CryptoError> {
    let key = key.trim();
    if key.starts_with("-----BEGIN") {
        return RsaPublicKey::from_public_key_pem(key)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(key))
            .map_err(|e| CryptoError::InvalidKey(e.to_string()));
    }
    let der = BASE64
        .decode(strip_whitespace(key))
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    RsaPublicKey::from_public_key_der(&der)
        .or_else(|_| RsaPublicKey::from_pkcs1_der(&der))
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Accept a PEM block (PKCS#8 or PKCS#1) or a bare base64 DER body
pub fn parse_private_key(key: &str) -> Result<RsaPrivateKey, CryptoError> {
    let key = key.trim();
    if key.starts_with("-----BEGIN") {
        return RsaPrivateKey::from_pkcs8_pem(key)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(key))
            .map_err(|e| CryptoError::InvalidKey(e.to_string()));
    }
    let der = BASE64
        .decode(strip_whitespace(key))
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    RsaPrivateKey::from_pkcs8_der(&der)
        .or_else(|_| RsaPrivateKey::from_pkcs1_der(&der))
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

fn strip_whitespace(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

/// RSA-SHA256 signature, base64 encoded
pub fn sign_rsa_sha256(key: &RsaPrivateKey, message: &[u8]) -> Result<String, CryptoError> {
    let signing_key = SigningKey::<Sha256>::new(key.clone());
    let signature = signing_key
        .try_sign(message)
        .map_err(|e| CryptoError::Signing(e.to_string()))?;
    Ok(BASE64.encode(signature.to_bytes()))
}

/// Verify a base64 RSA-SHA256 signature. Any decoding problem is a mismatch.
pub fn verify_rsa_sha256(key: &RsaPublicKey, message: &[u8], signature_b64: &str) -> bool {
    let Ok(raw) = BASE64.decode(signature_b64.trim()) else {
        return false;
    };
    let Ok(signature) = Signature::try_from(raw.as_slice()) else {
        return false;
    };
    VerifyingKey::<Sha256>::new(key.clone())
        .verify(message, &signature)
        .is_ok()
}

/// HMAC-SHA256 as lowercase hex
pub fn hmac_sha256_hex(secret: &[u8], message: &[u8]) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(message);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a hex HMAC-SHA256 signature
pub fn verify_hmac_sha256_hex(secret: &[u8], message: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(message);
    mac.verify_slice(&expected).is_ok()
}

/// Random alphanumeric nonce
pub fn nonce(len: usize) -> String {
    use rand::Rng;
    use rand::distributions::Alphanumeric;
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
pub(crate) mod test_keys {
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
    use rsa::{RsaPrivateKey, RsaPublicKey};

    /// Fresh 1024-bit key pair as (private PKCS#8 PEM, public SPKI PEM)
    pub fn generate_pem_pair() -> (String, String) {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("keygen");
        let public = RsaPublicKey::from(&private);
        let private_pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .expect("private pem")
            .to_string();
        let public_pem = public.to_public_key_pem(LineEnding::LF).expect("public pem");
        (private_pem, public_pem)
    }
}
