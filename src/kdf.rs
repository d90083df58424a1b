//! Turning a password into the key and IV that unwrap the master key.

use crate::footer::EncryptionFooter;
use crate::keystore::{self, SigningError, SigningOracle};
use sha1::Sha1;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// PBKDF2 iteration count.
pub const HASH_COUNT: u32 = 2000;
pub const KEY_LEN_BYTES: usize = 16;
pub const IV_LEN_BYTES: usize = 16;
pub const DERIVED_LEN: usize = KEY_LEN_BYTES + IV_LEN_BYTES;
/// Length of the hardened intermediate key kept in the footer.
pub const HARDENED_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum KdfError {
    #[error("unknown KDF type {0}")]
    UnknownKind(u8),
    #[error("invalid scrypt cost {0:?}")]
    InvalidCost(ScryptCost),
    #[error("scrypt output length rejected")]
    OutputLength,
    #[error(transparent)]
    Signing(#[from] SigningError),
}

pub type Result<T, E = KdfError> = core::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdfKind {
    Pbkdf2,
    Scrypt,
    /// scrypt, sign the result with the hardware key, scrypt the signature
    ScryptKeymaster,
}

impl KdfKind {
    pub const fn id(self) -> u8 {
        match self {
            KdfKind::Pbkdf2 => 1,
            KdfKind::Scrypt => 2,
            KdfKind::ScryptKeymaster => 5,
        }
    }
}

impl TryFrom<u8> for KdfKind {
    type Error = KdfError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(KdfKind::Pbkdf2),
            2 => Ok(KdfKind::Scrypt),
            5 => Ok(KdfKind::ScryptKeymaster),
            other => Err(KdfError::UnknownKind(other)),
        }
    }
}

/// scrypt cost exponents: N = 2^n_factor, r = 2^r_factor, p = 2^p_factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScryptCost {
    pub n_factor: u8,
    pub r_factor: u8,
    pub p_factor: u8,
}

impl ScryptCost {
    fn params(self, len: usize) -> Result<scrypt::Params> {
        let invalid = || KdfError::InvalidCost(self);
        let r = 1u32.checked_shl(self.r_factor.into()).ok_or_else(invalid)?;
        let p = 1u32.checked_shl(self.p_factor.into()).ok_or_else(invalid)?;
        scrypt::Params::new(self.n_factor, r, p, len).map_err(|_| invalid())
    }
}

/// Key and IV for the master key cipher, wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; DERIVED_LEN]);

impl DerivedKey {
    #[cfg(test)]
    pub(crate) fn from_raw(bytes: [u8; DERIVED_LEN]) -> Self {
        Self(bytes)
    }

    pub fn key(&self) -> &[u8] {
        &self.0[..KEY_LEN_BYTES]
    }

    pub fn iv(&self) -> &[u8] {
        &self.0[KEY_LEN_BYTES..]
    }

    /// The leading half, re-hardened and compared against the footer to
    /// tell a wrong password from a damaged footer.
    pub fn intermediate(&self) -> &[u8] {
        &self.0[..KEY_LEN_BYTES]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(..)")
    }
}

fn pbkdf2(password: &[u8], salt: &[u8]) -> Result<DerivedKey> {
    log::debug!("Using pbkdf2 for cryptfs KDF");
    let mut out = DerivedKey([0; DERIVED_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha1>(password, salt, HASH_COUNT, &mut out.0);
    Ok(out)
}

fn scrypt_into(input: &[u8], salt: &[u8], cost: ScryptCost, out: &mut [u8]) -> Result<()> {
    let params = cost.params(out.len())?;
    scrypt::scrypt(input, salt, &params, out).map_err(|_| KdfError::OutputLength)
}

fn scrypt(password: &[u8], salt: &[u8], cost: ScryptCost) -> Result<DerivedKey> {
    log::debug!("Using scrypt for cryptfs KDF");
    scrypt_into_key(password, salt, cost)
}

fn scrypt_keymaster(
    password: &[u8],
    salt: &[u8],
    cost: ScryptCost,
    key_blob: &[u8],
    oracle: &dyn SigningOracle,
) -> Result<DerivedKey> {
    log::debug!("Using scrypt with keymaster for cryptfs KDF");
    let first = scrypt_into_key(password, salt, cost)?;
    let signature = keystore::sign(oracle, key_blob, first.as_bytes())?;
    scrypt_into_key(&signature, salt, cost)
}

fn scrypt_into_key(input: &[u8], salt: &[u8], cost: ScryptCost) -> Result<DerivedKey> {
    let mut out = DerivedKey([0; DERIVED_LEN]);
    scrypt_into(input, salt, cost, &mut out.0)?;
    Ok(out)
}

/// Derives with the KDF recorded in the footer.
pub fn derive(
    password: &[u8],
    footer: &EncryptionFooter,
    oracle: &dyn SigningOracle,
) -> Result<DerivedKey> {
    derive_with(KdfKind::try_from(footer.kdf_type)?, password, footer, oracle)
}

/// Derives with an explicit KDF, using the footer's salt, cost and key blob.
pub fn derive_with(
    kind: KdfKind,
    password: &[u8],
    footer: &EncryptionFooter,
    oracle: &dyn SigningOracle,
) -> Result<DerivedKey> {
    match kind {
        KdfKind::Pbkdf2 => pbkdf2(password, &footer.salt),
        KdfKind::Scrypt => scrypt(password, &footer.salt, footer.cost()),
        KdfKind::ScryptKeymaster => {
            let blob = footer.key_blob().ok_or(SigningError::InvalidKeyBlob)?;
            scrypt_keymaster(password, &footer.salt, footer.cost(), blob, oracle)
        }
    }
}

/// The fingerprint stored as `scrypted_intermediate_key`.
pub fn harden(
    intermediate: &[u8],
    salt: &[u8],
    cost: ScryptCost,
) -> Result<Zeroizing<[u8; HARDENED_LEN]>> {
    let mut out = Zeroizing::new([0u8; HARDENED_LEN]);
    scrypt_into(intermediate, salt, cost, &mut out[..])?;
    Ok(out)
}
