//! Hardware signing oracle used to bind derived keys to the device.

use ambassador::{delegatable_trait, Delegate};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use zeroize::Zeroizing;

pub mod tpm;

pub use tpm::TpmKeystore;

#[derive(Error, Debug)]
pub enum SigningError {
    #[error("keystore is rate limiting requests")]
    RateLimited,
    #[error("no hardware keystore available")]
    Unavailable,
    #[error("key blob rejected by the keystore")]
    InvalidKeyBlob,
    #[error("keystore failure: {0}")]
    Backend(String),
}

pub type Result<T, E = SigningError> = core::result::Result<T, E>;

pub type Signature = Zeroizing<Vec<u8>>;

/// Size of the block handed to the keystore, matching a 2048 bit modulus.
pub const RSA_KEY_SIZE_BYTES: usize = 256;
pub const RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(1);

/// A raw private key operation with no padding or digest.
#[delegatable_trait]
pub trait SigningOracle {
    fn sign_block(&self, key_blob: &[u8], block: &[u8]) -> Result<Signature>;
}

/// Lays `payload` out so that, read as a big-endian integer, it is below
/// any modulus of [`RSA_KEY_SIZE_BYTES`]: a leading zero byte, then the
/// payload, then zero fill.
pub fn pad_block(payload: &[u8]) -> Zeroizing<[u8; RSA_KEY_SIZE_BYTES]> {
    let mut block = Zeroizing::new([0u8; RSA_KEY_SIZE_BYTES]);
    let len = payload.len().min(RSA_KEY_SIZE_BYTES - 1);
    block[1..1 + len].copy_from_slice(&payload[..len]);
    block
}

/// Pads and signs `payload`, waiting out one rate limit.
pub fn sign(oracle: &dyn SigningOracle, key_blob: &[u8], payload: &[u8]) -> Result<Signature> {
    let block = pad_block(payload);
    match oracle.sign_block(key_blob, &block[..]) {
        Err(SigningError::RateLimited) => {
            log::warn!(
                "Keystore rate limited, retrying in {}s",
                RATE_LIMIT_COOLDOWN.as_secs()
            );
            thread::sleep(RATE_LIMIT_COOLDOWN);
            oracle.sign_block(key_blob, &block[..])
        }
        other => other,
    }
}

/// Backend for builds and devices without a keystore.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoKeystore;

impl SigningOracle for NoKeystore {
    fn sign_block(&self, _key_blob: &[u8], _block: &[u8]) -> Result<Signature> {
        Err(SigningError::Unavailable)
    }
}

#[derive(Delegate)]
#[delegate(SigningOracle)]
pub enum Keystore {
    Tpm(TpmKeystore),
    Absent(NoKeystore),
}

impl Keystore {
    /// Picks the TPM when one answers, otherwise the absent backend.
    pub fn probe() -> Self {
        match TpmKeystore::open() {
            Ok(tpm) => {
                log::info!("Using TPM keystore");
                Keystore::Tpm(tpm)
            }
            Err(e) => {
                log::info!("No hardware keystore ({e}), keymaster KDF unavailable");
                Keystore::Absent(NoKeystore)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeOracle;
    use eyre::Result;

    #[test]
    fn padding_layout() {
        let block = pad_block(&[0xff; 32]);
        assert_eq!(block[0], 0);
        assert!(block[1..33].iter().all(|&b| b == 0xff));
        assert!(block[33..].iter().all(|&b| b == 0));
    }

    #[test]
    fn oversized_payload_is_truncated() {
        let block = pad_block(&[0xab; 300]);
        assert_eq!(block[0], 0);
        assert!(block[1..].iter().all(|&b| b == 0xab));
    }

    #[test]
    fn signs_padded_block() -> Result<()> {
        let oracle = FakeOracle::default();
        let signature = sign(&oracle, b"blob", b"payload")?;
        assert_eq!(signature, oracle.expected(b"blob", &pad_block(b"payload")[..]));
        assert_eq!(oracle.calls(), 1);
        Ok(())
    }

    #[test]
    fn retries_once_after_rate_limit() -> Result<()> {
        let oracle = FakeOracle::rate_limited(1);
        sign(&oracle, b"blob", b"payload")?;
        assert_eq!(oracle.calls(), 2);
        Ok(())
    }

    #[test]
    fn second_rate_limit_fails() {
        let oracle = FakeOracle::rate_limited(2);
        assert!(matches!(
            sign(&oracle, b"blob", b"payload"),
            Err(SigningError::RateLimited)
        ));
        assert_eq!(oracle.calls(), 2);
    }

    #[test]
    fn absent_keystore() {
        let keystore = Keystore::Absent(NoKeystore);
        assert!(matches!(
            sign(&keystore, b"blob", b"payload"),
            Err(SigningError::Unavailable)
        ));
    }
}
