//! System properties shared with the surrounding init/vold process.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// `encrypted` once the data partition has been encrypted.
pub const CRYPTO_STATE: &str = "ro.crypto.state";
/// Non-empty while an in-place encryption is running.
pub const ENCRYPT_PROGRESS: &str = "vold.encrypt_progress";
/// Path of the decrypted block device after a successful unlock.
pub const FS_CRYPTO_BLKDEV: &str = "ro.crypto.fs_crypto_blkdev";

pub trait PropertyStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
}

#[derive(Debug, Default)]
pub struct MemoryProperties(Mutex<HashMap<String, String>>);

impl MemoryProperties {
    pub fn with(self, key: &str, value: &str) -> Self {
        self.set(key, value);
        self
    }
}

impl PropertyStore for MemoryProperties {
    fn get(&self, key: &str) -> Option<String> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value.to_owned());
    }
}
