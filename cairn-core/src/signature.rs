//! Key-ownership signatures.
//!
//! Every file upload is challenged with a one-time nonce; the writer signs
//! the nonce with the Ed25519 key it claims to own and sends key and
//! signature as hex header values.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("public key is not valid hex: {0}")]
    KeyHex(#[source] hex::FromHexError),

    #[error("signature is not valid hex: {0}")]
    SignatureHex(#[source] hex::FromHexError),

    #[error("public key must be 32 bytes, got {0}")]
    KeyLength(usize),

    #[error("signature must be 64 bytes, got {0}")]
    SignatureLength(usize),

    #[error("public key does not decode to a curve point")]
    KeyDecompression,
}

/// Verifies an Ed25519 signature over the nonce bytes.
///
/// Returns `Ok(false)` when the signature simply does not verify; malformed
/// key or signature material is an error so callers can distinguish a bad
/// writer from a bad request.
pub fn verify_key_ownership_signature(
    nonce: &str,
    signature_hex: &str,
    public_key_hex: &str,
) -> Result<bool, SignatureError> {
    let key_bytes = hex::decode(public_key_hex).map_err(SignatureError::KeyHex)?;
    let key_bytes: [u8; 32] = key_bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| SignatureError::KeyLength(bytes.len()))?;
    let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| SignatureError::KeyDecompression)?;

    let sig_bytes = hex::decode(signature_hex).map_err(SignatureError::SignatureHex)?;
    let sig_bytes: [u8; 64] = sig_bytes
        .try_into()
        .map_err(|bytes: Vec<u8>| SignatureError::SignatureLength(bytes.len()))?;
    let signature = Signature::from_bytes(&sig_bytes);

    Ok(key.verify(nonce.as_bytes(), &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    fn keypair() -> SigningKey {
        SigningKey::from_bytes(&[42u8; 32])
    }

    #[test]
    fn accepts_valid_signature() {
        let signing = keypair();
        let nonce = "00112233445566778899aabbccddeeff";
        let signature = signing.sign(nonce.as_bytes());

        let ok = verify_key_ownership_signature(
            nonce,
            &hex::encode(signature.to_bytes()),
            &hex::encode(signing.verifying_key().to_bytes()),
        )
        .unwrap();
        assert!(ok);
    }

    #[test]
    fn rejects_signature_over_other_nonce() {
        let signing = keypair();
        let signature = signing.sign(b"some other nonce");

        let ok = verify_key_ownership_signature(
            "00112233445566778899aabbccddeeff",
            &hex::encode(signature.to_bytes()),
            &hex::encode(signing.verifying_key().to_bytes()),
        )
        .unwrap();
        assert!(!ok);
    }

    #[test]
    fn malformed_material_is_an_error() {
        assert!(matches!(
            verify_key_ownership_signature("nonce", "zz", "aabb"),
            Err(SignatureError::KeyLength(2))
        ));
        let key = hex::encode(keypair().verifying_key().to_bytes());
        assert!(matches!(
            verify_key_ownership_signature("nonce", "zz", &key),
            Err(SignatureError::SignatureHex(_))
        ));
    }
}
