//! Secure randomness for identifiers
//!
//! Client ids, communication ids and generated subdomains all come from the
//! system CSPRNG so they cannot be guessed by other clients.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("System random number generator failed")]
    Rng,
}

/// Fill a buffer with cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).map_err(|_| CryptoError::Rng)
}

/// `len` random bytes, lower-case hex encoded
pub fn random_hex(len: usize) -> Result<String, CryptoError> {
    let mut buf = vec![0u8; len];
    random_bytes(&mut buf)?;
    Ok(buf.iter().map(|b| format!("{:02x}", b)).collect())
}
