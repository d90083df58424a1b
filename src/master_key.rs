//! Unwrapping the master key and rendering keys for dm-crypt.

use crate::kdf::{DerivedKey, KEY_LEN_BYTES};
use aes::Aes128;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
    #[error("derived key or IV has the wrong length")]
    KeyIv,
    #[error("master key is not block aligned")]
    Unaligned,
    #[error("decrypted {0} bytes, expected {KEY_LEN_BYTES}")]
    Length(usize),
}

pub type Result<T, E = CryptoError> = core::result::Result<T, E>;

/// The disk key. Wiped on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct MasterKey(Zeroizing<Vec<u8>>);

impl MasterKey {
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self(Zeroizing::new(bytes.to_vec()))
    }

    /// Placeholder key of `len` zero bytes.
    pub fn zeroed(len: usize) -> Self {
        Self(Zeroizing::new(vec![0; len]))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn ct_eq(&self, other: &MasterKey) -> bool {
        self.0.as_slice().ct_eq(other.0.as_slice()).into()
    }
}

impl AsRef<[u8]> for MasterKey {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MasterKey({} bytes)", self.0.len())
    }
}

/// AES-128-CBC without padding over a single key-sized block.
pub fn decrypt(encrypted: &[u8], derived: &DerivedKey) -> Result<MasterKey> {
    let cipher = cbc::Decryptor::<Aes128>::new_from_slices(derived.key(), derived.iv())
        .map_err(|_| CryptoError::KeyIv)?;
    let mut out = Zeroizing::new([0u8; KEY_LEN_BYTES]);
    let encrypted = encrypted.get(..KEY_LEN_BYTES).ok_or(CryptoError::Unaligned)?;
    let plain = cipher
        .decrypt_padded_b2b_mut::<NoPadding>(encrypted, &mut out[..])
        .map_err(|_| CryptoError::Unaligned)?;
    if plain.len() != KEY_LEN_BYTES {
        return Err(CryptoError::Length(plain.len()));
    }
    Ok(MasterKey::from_slice(plain))
}

/// Inverse of [`decrypt`], used when enrolling a password.
pub fn encrypt(master_key: &MasterKey, derived: &DerivedKey) -> Result<[u8; KEY_LEN_BYTES]> {
    let cipher = cbc::Encryptor::<Aes128>::new_from_slices(derived.key(), derived.iv())
        .map_err(|_| CryptoError::KeyIv)?;
    let mut out = [0u8; KEY_LEN_BYTES];
    let written = cipher
        .encrypt_padded_b2b_mut::<NoPadding>(master_key.as_bytes(), &mut out)
        .map_err(|_| CryptoError::Unaligned)?
        .len();
    if written != KEY_LEN_BYTES {
        return Err(CryptoError::Length(written));
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HexCase {
    /// `0-9a-f`, used for dm-crypt tables and the hardware key migration
    Lower,
    /// `0-9A-F`, how pre-migration passwords were handed over
    Upper,
}

/// Two ASCII hex digits per byte, no `0x` prefix.
pub fn to_hex_ascii(bytes: &[u8], case: HexCase) -> Zeroizing<String> {
    Zeroizing::new(match case {
        HexCase::Lower => hex::encode(bytes),
        HexCase::Upper => hex::encode_upper(bytes),
    })
}
