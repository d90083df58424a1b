//! Inline (hardware offload) disk encryption engines.
//!
//! Some platforms keep the disk key inside the storage controller. The
//! password is handed to the engine, which answers with a key slot index
//! instead of key material.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum InlineCryptoError {
    #[error("no inline crypto engine")]
    Unsupported,
    #[error("inline crypto engine rejected the key")]
    Rejected,
}

pub type Result<T, E = InlineCryptoError> = core::result::Result<T, E>;

/// Slot of the programmed key inside the engine.
pub type KeyIndex = i32;

pub trait InlineCrypto {
    /// Whether `cipher` names a hardware-backed mode.
    fn is_hw_disk_encryption(&self, cipher: &str) -> bool;
    /// Whether the inline crypto engine (ICE) is in use.
    fn ice_enabled(&self) -> bool;
    /// Whether the password should be bound to the hardware keystore first.
    fn should_use_keymaster(&self) -> bool;
    fn set_key(&self, material: &[u8], cipher: &str) -> Result<KeyIndex>;
    fn update_key(&self, old: &[u8], new: &[u8], cipher: &str) -> Result<KeyIndex>;
}

/// Platform without an inline engine, everything goes through dm-crypt.
#[derive(Debug, Default)]
pub struct NoInlineCrypto;

impl InlineCrypto for NoInlineCrypto {
    fn is_hw_disk_encryption(&self, _cipher: &str) -> bool {
        false
    }

    fn ice_enabled(&self) -> bool {
        false
    }

    fn should_use_keymaster(&self) -> bool {
        false
    }

    fn set_key(&self, _material: &[u8], _cipher: &str) -> Result<KeyIndex> {
        Err(InlineCryptoError::Unsupported)
    }

    fn update_key(&self, _old: &[u8], _new: &[u8], _cipher: &str) -> Result<KeyIndex> {
        Err(InlineCryptoError::Unsupported)
    }
}
