//! The crypto footer: the fixed-size, versioned record that holds everything
//! needed to unlock the encrypted partition except the password itself.
//!
//! The layout is the packed little-endian 1.3 footer. Reserved and
//! persist-data fields are carried through untouched so that a footer read
//! from disk and stored again only differs in the fields we mutate.

use crate::kdf::ScryptCost;
use bincode::{Decode, Encode};
use bitflags::bitflags;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::path::PathBuf;
use thiserror::Error;

pub mod store;

pub use store::{FooterLocation, FooterStore};

pub const CRYPT_MNT_MAGIC: u32 = 0xD0B5_B1C4;
pub const CURRENT_MAJOR_VERSION: u16 = 1;
pub const CURRENT_MINOR_VERSION: u16 = 3;

pub const MAX_CRYPTO_TYPE_NAME_LEN: usize = 64;
pub const MAX_KEY_LEN: usize = 48;
pub const SALT_LEN: usize = 16;
pub const SCRYPT_LEN: usize = 32;
pub const SHA256_LEN: usize = 32;
pub const KEYMASTER_BLOB_SIZE: usize = 2048;

/// Size of the on-disk record in bytes.
pub const FOOTER_LEN: usize = 2348;

#[derive(Error, Debug)]
pub enum FooterError {
    #[error("footer I/O failed on `{path}`")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("crypto key location `{0}` is not an absolute path")]
    Config(PathBuf),
    #[error("bad footer magic {0:#010x}")]
    BadMagic(u32),
    #[error("cannot understand footer major version {found}, expected {expected}")]
    UnsupportedMajorVersion { found: u16, expected: u16 },
    #[error("footer file `{path}` is {len} bytes, expected {expected}")]
    BadKeyFileSize {
        path: PathBuf,
        len: u64,
        expected: u64,
    },
    #[error("unknown crypt type {0}")]
    UnknownCryptType(u32),
    #[error("cipher name of {0} bytes does not fit the footer")]
    CipherNameTooLong(usize),
    #[error("footer record does not decode")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("footer record does not encode")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("footer record encoded to {0} bytes, expected {}", FOOTER_LEN)]
    Length(usize),
}

impl FooterError {
    /// True for failures caused by the record's content rather than the
    /// medium it lives on.
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self,
            FooterError::BadMagic(_)
                | FooterError::UnsupportedMajorVersion { .. }
                | FooterError::BadKeyFileSize { .. }
                | FooterError::Decode(_)
        )
    }
}

pub type Result<T, E = FooterError> = core::result::Result<T, E>;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Flags: u32 {
        /// The master key is stored in the clear; there is no password.
        const KEY_UNENCRYPTED = 0x1;
        const ENCRYPTION_IN_PROGRESS = 0x2;
        /// An encryption run was interrupted and the data cannot be trusted.
        const INCONSISTENT_STATE = 0x4;
        const DATA_CORRUPT = 0x8;
        const FORCE_ENCRYPTION = 0x10;
        const FORCE_COMPLETE = 0x20;
        /// The hardware key has been migrated from the hex password form.
        const ASCII_PASSWORD_UPDATED = 0x40;
    }
}

/// What the user types to unlock the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptType {
    Password,
    Pattern,
    Pin,
    /// No user credential, the fixed default password is used.
    Default,
}

impl CryptType {
    pub const fn id(self) -> u32 {
        match self {
            CryptType::Password => 0,
            CryptType::Pattern => 1,
            CryptType::Pin => 2,
            CryptType::Default => 3,
        }
    }
}

impl TryFrom<u32> for CryptType {
    type Error = FooterError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(CryptType::Password),
            1 => Ok(CryptType::Pattern),
            2 => Ok(CryptType::Pin),
            3 => Ok(CryptType::Default),
            other => Err(FooterError::UnknownCryptType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionFooter {
    pub magic: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub ftr_size: u32,
    pub flags: Flags,
    /// Size of the master key in bytes.
    pub keysize: u32,
    /// Raw [`CryptType`] id.
    pub crypt_type: u32,
    /// Size of the encrypted filesystem in 512 byte sectors.
    pub fs_size: u64,
    pub failed_decrypt_count: u32,
    pub crypto_type_name: [u8; MAX_CRYPTO_TYPE_NAME_LEN],
    pub spare2: u32,
    pub master_key: [u8; MAX_KEY_LEN],
    pub salt: [u8; SALT_LEN],
    pub persist_data_offset: [u64; 2],
    pub persist_data_size: u32,
    /// Raw [`crate::kdf::KdfKind`] id.
    pub kdf_type: u8,
    pub n_factor: u8,
    pub r_factor: u8,
    pub p_factor: u8,
    pub encrypted_upto: u64,
    pub hash_first_block: [u8; SHA256_LEN],
    pub keymaster_blob: [u8; KEYMASTER_BLOB_SIZE],
    pub keymaster_blob_size: u32,
    pub scrypted_intermediate_key: [u8; SCRYPT_LEN],
    pub sha256: [u8; SHA256_LEN],
}

impl Default for EncryptionFooter {
    fn default() -> Self {
        Self {
            magic: CRYPT_MNT_MAGIC,
            major_version: CURRENT_MAJOR_VERSION,
            minor_version: CURRENT_MINOR_VERSION,
            ftr_size: FOOTER_LEN as u32,
            flags: Flags::empty(),
            keysize: 0,
            crypt_type: CryptType::Password.id(),
            fs_size: 0,
            failed_decrypt_count: 0,
            crypto_type_name: [0; MAX_CRYPTO_TYPE_NAME_LEN],
            spare2: 0,
            master_key: [0; MAX_KEY_LEN],
            salt: [0; SALT_LEN],
            persist_data_offset: [0; 2],
            persist_data_size: 0,
            kdf_type: 0,
            n_factor: 0,
            r_factor: 0,
            p_factor: 0,
            encrypted_upto: 0,
            hash_first_block: [0; SHA256_LEN],
            keymaster_blob: [0; KEYMASTER_BLOB_SIZE],
            keymaster_blob_size: 0,
            scrypted_intermediate_key: [0; SCRYPT_LEN],
            sha256: [0; SHA256_LEN],
        }
    }
}

/// Field-for-field mirror of the on-disk record. Only this type goes through
/// bincode; [`EncryptionFooter`] is the typed view the rest of the crate uses.
#[derive(Debug, Clone, Encode, Decode, PartialEq)]
struct FooterRaw {
    magic: u32,
    major_version: u16,
    minor_version: u16,
    ftr_size: u32,
    flags: u32,
    keysize: u32,
    crypt_type: u32,
    fs_size: u64,
    failed_decrypt_count: u32,
    crypto_type_name: [u8; MAX_CRYPTO_TYPE_NAME_LEN],
    spare2: u32,
    master_key: [u8; MAX_KEY_LEN],
    salt: [u8; SALT_LEN],
    persist_data_offset: [u64; 2],
    persist_data_size: u32,
    kdf_type: u8,
    n_factor: u8,
    r_factor: u8,
    p_factor: u8,
    encrypted_upto: u64,
    hash_first_block: [u8; SHA256_LEN],
    keymaster_blob: [u8; KEYMASTER_BLOB_SIZE],
    keymaster_blob_size: u32,
    scrypted_intermediate_key: [u8; SCRYPT_LEN],
    sha256: [u8; SHA256_LEN],
}

fn codec() -> impl bincode::config::Config {
    bincode::config::legacy()
        .with_little_endian()
        .with_fixed_int_encoding()
}

impl From<FooterRaw> for EncryptionFooter {
    fn from(raw: FooterRaw) -> Self {
        Self {
            magic: raw.magic,
            major_version: raw.major_version,
            minor_version: raw.minor_version,
            ftr_size: raw.ftr_size,
            // unknown bits are carried through
            flags: Flags::from_bits_retain(raw.flags),
            keysize: raw.keysize,
            crypt_type: raw.crypt_type,
            fs_size: raw.fs_size,
            failed_decrypt_count: raw.failed_decrypt_count,
            crypto_type_name: raw.crypto_type_name,
            spare2: raw.spare2,
            master_key: raw.master_key,
            salt: raw.salt,
            persist_data_offset: raw.persist_data_offset,
            persist_data_size: raw.persist_data_size,
            kdf_type: raw.kdf_type,
            n_factor: raw.n_factor,
            r_factor: raw.r_factor,
            p_factor: raw.p_factor,
            encrypted_upto: raw.encrypted_upto,
            hash_first_block: raw.hash_first_block,
            keymaster_blob: raw.keymaster_blob,
            keymaster_blob_size: raw.keymaster_blob_size,
            scrypted_intermediate_key: raw.scrypted_intermediate_key,
            sha256: raw.sha256,
        }
    }
}

impl From<&EncryptionFooter> for FooterRaw {
    fn from(footer: &EncryptionFooter) -> Self {
        Self {
            magic: footer.magic,
            major_version: footer.major_version,
            minor_version: footer.minor_version,
            ftr_size: footer.ftr_size,
            flags: footer.flags.bits(),
            keysize: footer.keysize,
            crypt_type: footer.crypt_type,
            fs_size: footer.fs_size,
            failed_decrypt_count: footer.failed_decrypt_count,
            crypto_type_name: footer.crypto_type_name,
            spare2: footer.spare2,
            master_key: footer.master_key,
            salt: footer.salt,
            persist_data_offset: footer.persist_data_offset,
            persist_data_size: footer.persist_data_size,
            kdf_type: footer.kdf_type,
            n_factor: footer.n_factor,
            r_factor: footer.r_factor,
            p_factor: footer.p_factor,
            encrypted_upto: footer.encrypted_upto,
            hash_first_block: footer.hash_first_block,
            keymaster_blob: footer.keymaster_blob,
            keymaster_blob_size: footer.keymaster_blob_size,
            scrypted_intermediate_key: footer.scrypted_intermediate_key,
            sha256: footer.sha256,
        }
    }
}

impl EncryptionFooter {
    /// Decodes a record without validating it, see [`EncryptionFooter::check_version`].
    pub fn from_bytes(buf: &[u8; FOOTER_LEN]) -> Result<Self> {
        let (raw, _): (FooterRaw, usize) = bincode::decode_from_slice(buf, codec())?;
        Ok(raw.into())
    }

    pub fn to_bytes(&self) -> Result<[u8; FOOTER_LEN]> {
        let mut buf = [0u8; FOOTER_LEN];
        let written = bincode::encode_into_slice(FooterRaw::from(self), &mut buf, codec())?;
        if written != FOOTER_LEN {
            return Err(FooterError::Length(written));
        }
        Ok(buf)
    }

    /// Only the magic and the major version are checked when a footer is
    /// read. The checksum is not.
    pub fn check_version(&self) -> Result<()> {
        if self.magic != CRYPT_MNT_MAGIC {
            return Err(FooterError::BadMagic(self.magic));
        }
        if self.major_version != CURRENT_MAJOR_VERSION {
            return Err(FooterError::UnsupportedMajorVersion {
                found: self.major_version,
                expected: CURRENT_MAJOR_VERSION,
            });
        }
        Ok(())
    }

    /// SHA-256 over the record with the checksum field zeroed.
    pub fn compute_checksum(&self) -> Result<[u8; SHA256_LEN]> {
        let mut bytes = self.to_bytes()?;
        bytes[FOOTER_LEN - SHA256_LEN..].fill(0);
        Ok(Sha256::digest(bytes).into())
    }

    pub fn seal(&mut self) -> Result<()> {
        self.sha256 = self.compute_checksum()?;
        Ok(())
    }

    pub fn checksum_is_valid(&self) -> bool {
        matches!(self.compute_checksum(), Ok(sum) if sum == self.sha256)
    }

    /// The dm-crypt cipher specification, e.g. `aes-cbc-essiv:sha256`.
    pub fn cipher_name(&self) -> Cow<'_, str> {
        let end = self
            .crypto_type_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_CRYPTO_TYPE_NAME_LEN);
        String::from_utf8_lossy(&self.crypto_type_name[..end])
    }

    pub fn set_cipher_name(&mut self, name: &str) -> Result<()> {
        // keep room for the terminating NUL
        if name.len() >= MAX_CRYPTO_TYPE_NAME_LEN {
            return Err(FooterError::CipherNameTooLong(name.len()));
        }
        self.crypto_type_name = [0; MAX_CRYPTO_TYPE_NAME_LEN];
        self.crypto_type_name[..name.len()].copy_from_slice(name.as_bytes());
        Ok(())
    }

    pub fn password_type(&self) -> Result<CryptType> {
        CryptType::try_from(self.crypt_type)
    }

    pub fn cost(&self) -> ScryptCost {
        ScryptCost {
            n_factor: self.n_factor,
            r_factor: self.r_factor,
            p_factor: self.p_factor,
        }
    }

    /// `keysize` bytes of the stored key, clamped to the field size.
    pub fn stored_master_key(&self) -> &[u8] {
        let len = (self.keysize as usize).min(MAX_KEY_LEN);
        &self.master_key[..len]
    }

    /// The opaque hardware key blob, `None` if the recorded size overruns
    /// the blob field.
    pub fn key_blob(&self) -> Option<&[u8]> {
        self.keymaster_blob.get(..self.keymaster_blob_size as usize)
    }

    pub fn set_key_blob(&mut self, blob: &[u8]) -> Option<()> {
        let slot = self.keymaster_blob.get_mut(..blob.len())?;
        slot.copy_from_slice(blob);
        self.keymaster_blob_size = blob.len() as u32;
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    fn sample() -> Result<EncryptionFooter> {
        let mut footer = EncryptionFooter {
            keysize: 16,
            crypt_type: CryptType::Pin.id(),
            fs_size: 0x1234_5678,
            failed_decrypt_count: 2,
            kdf_type: 2,
            n_factor: 15,
            r_factor: 3,
            p_factor: 1,
            persist_data_offset: [0x1000, 0x2000],
            encrypted_upto: 77,
            flags: Flags::ASCII_PASSWORD_UPDATED | Flags::FORCE_COMPLETE,
            ..Default::default()
        };
        footer.set_cipher_name("aes-cbc-essiv:sha256")?;
        footer.salt.copy_from_slice(&[7; SALT_LEN]);
        footer.master_key[..16].copy_from_slice(&[0xa5; 16]);
        footer
            .set_key_blob(b"opaque key blob")
            .ok_or_else(|| eyre::eyre!("blob too large"))?;
        Ok(footer)
    }

    #[test]
    fn layout_offsets() -> Result<()> {
        let footer = sample()?;
        let bytes = footer.to_bytes()?;
        assert_eq!(&bytes[..4], &CRYPT_MNT_MAGIC.to_le_bytes());
        assert_eq!(&bytes[24..32], &0x1234_5678u64.to_le_bytes());
        assert_eq!(&bytes[36..56], b"aes-cbc-essiv:sha256");
        assert_eq!(&bytes[104..120], &[0xa5; 16]);
        assert_eq!(&bytes[188..192], &[2, 15, 3, 1]);
        assert_eq!(&bytes[2280..2284], &15u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &0x60u32.to_le_bytes());
        assert_eq!(&bytes[168..176], &0x1000u64.to_le_bytes());
        assert_eq!(&bytes[176..184], &0x2000u64.to_le_bytes());
        Ok(())
    }

    #[test]
    fn decode_encoded() -> Result<()> {
        let footer = sample()?;
        assert_eq!(EncryptionFooter::from_bytes(&footer.to_bytes()?)?, footer);
        Ok(())
    }

    #[test]
    fn unknown_flag_bits_survive() -> Result<()> {
        let mut bytes = EncryptionFooter::default().to_bytes()?;
        bytes[12..16].copy_from_slice(&0x8000_0041u32.to_le_bytes());
        let footer = EncryptionFooter::from_bytes(&bytes)?;
        assert!(footer.flags.contains(Flags::ASCII_PASSWORD_UPDATED | Flags::KEY_UNENCRYPTED));
        assert_eq!(footer.flags.bits(), 0x8000_0041);
        assert_eq!(&footer.to_bytes()?[12..16], &0x8000_0041u32.to_le_bytes());
        Ok(())
    }

    #[test]
    fn checksum_covers_zeroed_field() -> Result<()> {
        let mut footer = sample()?;
        assert!(!footer.checksum_is_valid());
        footer.seal()?;
        assert!(footer.checksum_is_valid());

        let mut zeroed = footer.to_bytes()?;
        zeroed[FOOTER_LEN - SHA256_LEN..].fill(0);
        let expected: [u8; SHA256_LEN] = Sha256::digest(zeroed).into();
        assert_eq!(footer.sha256, expected);

        footer.failed_decrypt_count += 1;
        assert!(!footer.checksum_is_valid());
        Ok(())
    }

    #[test]
    fn version_checks() {
        let footer = EncryptionFooter {
            magic: 0xdead_beef,
            ..Default::default()
        };
        assert!(matches!(
            footer.check_version(),
            Err(FooterError::BadMagic(0xdead_beef))
        ));

        let footer = EncryptionFooter {
            major_version: 2,
            ..Default::default()
        };
        assert!(matches!(
            footer.check_version(),
            Err(FooterError::UnsupportedMajorVersion { found: 2, .. })
        ));

        let footer = EncryptionFooter {
            minor_version: CURRENT_MINOR_VERSION + 4,
            ..Default::default()
        };
        assert!(footer.check_version().is_ok());
    }

    #[test]
    fn cipher_name_bounds() {
        let mut footer = EncryptionFooter::default();
        assert_eq!(footer.cipher_name(), "");
        assert!(footer.set_cipher_name(&"x".repeat(64)).is_err());
        assert!(footer.set_cipher_name(&"x".repeat(63)).is_ok());
        assert_eq!(footer.cipher_name().len(), 63);
    }

    #[test]
    fn oversized_blob_length_is_rejected() {
        let footer = EncryptionFooter {
            keymaster_blob_size: KEYMASTER_BLOB_SIZE as u32 + 1,
            ..Default::default()
        };
        assert!(footer.key_blob().is_none());
    }

    #[test]
    fn crypt_types() {
        for t in [
            CryptType::Password,
            CryptType::Pattern,
            CryptType::Pin,
            CryptType::Default,
        ] {
            assert_eq!(CryptType::try_from(t.id()).ok(), Some(t));
        }
        assert!(matches!(
            CryptType::try_from(9),
            Err(FooterError::UnknownCryptType(9))
        ));
    }
}
