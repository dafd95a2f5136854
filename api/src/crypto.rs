//! Credential handling: RSA decryption of client-encrypted secrets,
//! argon2 password hashing, and opaque token/code generation.
//!
//! The browser encrypts passwords and verification codes against the
//! server's public key (PKCS#1 v1.5) and sends them base64-encoded; the
//! private key is loaded once at startup and injected into the app state.

use argon2::password_hash::{
    rand_core::{OsRng, RngCore},
    PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::Argon2;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, LineEnding};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use std::path::Path;

use crate::error::ApiError;

pub struct CredentialCipher {
    private_key: RsaPrivateKey,
    public_pem: String,
}

impl CredentialCipher {
    pub fn load(path: &Path) -> Result<Self, ApiError> {
        let pem = std::fs::read_to_string(path)
            .map_err(|e| ApiError::Internal(format!("reading {}: {e}", path.display())))?;

        // Key generation tooling writes PKCS#1; accept PKCS#8 as well.
        let private_key = match RsaPrivateKey::from_pkcs1_pem(&pem) {
            Ok(key) => key,
            Err(_) => RsaPrivateKey::from_pkcs8_pem(&pem)
                .map_err(|e| ApiError::Internal(format!("invalid RSA private key: {e}")))?,
        };

        Ok(Self::from_key(private_key))
    }

    pub fn from_key(private_key: RsaPrivateKey) -> Self {
        let public_pem = RsaPublicKey::from(&private_key)
            .to_pkcs1_pem(LineEnding::LF)
            .expect("PEM-encoding a public key cannot fail");
        Self {
            private_key,
            public_pem,
        }
    }

    /// PEM public key handed to the frontend for credential encryption.
    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }

    /// Decrypts a base64-encoded PKCS#1 v1.5 ciphertext. Every failure mode
    /// (bad base64, wrong key, corrupt ciphertext, non-UTF-8 plaintext)
    /// collapses into the same generic validation error.
    pub fn decrypt(&self, ciphertext_b64: &str) -> Result<String, ApiError> {
        let raw = BASE64
            .decode(ciphertext_b64.trim())
            .map_err(|_| ApiError::decryption_failed())?;
        let plain = self
            .private_key
            .decrypt(Pkcs1v15Encrypt, &raw)
            .map_err(|_| ApiError::decryption_failed())?;
        String::from_utf8(plain).map_err(|_| ApiError::decryption_failed())
    }

    #[cfg(test)]
    pub(crate) fn encrypt(&self, plaintext: &str) -> String {
        let public_key = RsaPublicKey::from(&self.private_key);
        let ciphertext = public_key
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, plaintext.as_bytes())
            .expect("encrypt");
        BASE64.encode(ciphertext)
    }
}

pub fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| ApiError::Internal(format!("password hashing: {e}")))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

/// 40-hex-char opaque auth token.
pub fn generate_token() -> String {
    let mut buf = [0u8; 20];
    OsRng.fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}

/// 6-digit verification code, zero-padded.
pub fn generate_code() -> String {
    use rand::Rng;
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrypt_recovers_encrypted_plaintext() {
        let cipher = CredentialCipher::from_key(test_keys::private_key());
        let ciphertext = cipher.encrypt("s3cret-Passw0rd");
        assert_eq!(cipher.decrypt(&ciphertext).unwrap(), "s3cret-Passw0rd");
    }

    #[test]
    fn corrupted_ciphertext_yields_generic_error() {
        let cipher = CredentialCipher::from_key(test_keys::private_key());
        let mut ciphertext = cipher.encrypt("s3cret");
        // Flip a character somewhere in the middle of the base64 body.
        let mid = ciphertext.len() / 2;
        let replacement = if &ciphertext[mid..mid + 1] == "A" { "B" } else { "A" };
        ciphertext.replace_range(mid..mid + 1, replacement);

        match cipher.decrypt(&ciphertext) {
            Err(ApiError::Validation(msg)) => assert_eq!(msg, "decryption failed"),
            other => panic!("expected generic validation error, got {other:?}"),
        }
    }

    #[test]
    fn malformed_base64_yields_generic_error() {
        let cipher = CredentialCipher::from_key(test_keys::private_key());
        match cipher.decrypt("%%% not base64 %%%") {
            Err(ApiError::Validation(msg)) => assert_eq!(msg, "decryption failed"),
            other => panic!("expected generic validation error, got {other:?}"),
        }
    }

    #[test]
    fn password_hash_round_trip() {
        let hash = hash_password("NewPassword123").unwrap();
        assert!(verify_password("NewPassword123", &hash));
        assert!(!verify_password("WrongPassword", &hash));
        assert!(!verify_password("NewPassword123", "not-a-phc-string"));
    }

    #[test]
    fn token_and_code_formats() {
        let token = generate_token();
        assert_eq!(token.len(), 40);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));

        let code = generate_code();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }
}
