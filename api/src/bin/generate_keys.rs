//! Generates the RSA keypair used for credential transport.
//!
//! The API loads `private.pem` at startup; the frontend fetches the
//! matching public key from `/api/auth/public-key`.

use rsa::pkcs1::{EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::pkcs8::LineEnding;
use rsa::{RsaPrivateKey, RsaPublicKey};

fn main() {
    let key_dir = std::env::args().nth(1).unwrap_or_else(|| "keys".to_string());
    std::fs::create_dir_all(&key_dir).expect("Failed to create key directory");

    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("Failed to generate RSA key");
    let public_key = RsaPublicKey::from(&private_key);

    private_key
        .write_pkcs1_pem_file(format!("{key_dir}/private.pem"), LineEnding::LF)
        .expect("Failed to write private key");
    public_key
        .write_pkcs1_pem_file(format!("{key_dir}/public.pem"), LineEnding::LF)
        .expect("Failed to write public key");

    println!("RSA keys generated in {key_dir}/");
}
