//! Password checks against the crypto footer and unlocking of the data
//! partition.

use crate::blkdev;
use crate::config::{Config, ConfigError};
use crate::dm::{CipherBackend, DeviceMapper, MappingRequest, ProvisionError, Provisioner};
use crate::footer::{CryptType, EncryptionFooter, Flags, FooterError, FooterStore};
use crate::inline::{InlineCrypto, KeyIndex, NoInlineCrypto};
use crate::kdf::{self, DerivedKey, KdfError, KdfKind, KEY_LEN_BYTES};
use crate::keystore::{NoKeystore, SigningOracle};
use crate::master_key::{self, to_hex_ascii, CryptoError, HexCase, MasterKey};
use crate::mount::{Mounter, SystemMounter};
use crate::props::{
    MemoryProperties, PropertyStore, CRYPTO_STATE, ENCRYPT_PROGRESS, FS_CRYPTO_BLKDEV,
};
use either::Either;
use once_cell::sync::OnceCell;
use std::fs::{DirBuilder, File};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

/// "default_password" as hex, what pre-migration devices with no user
/// password were keyed with.
pub const DEFAULT_HEX_PASSWORD: &str = "64656661756c745f70617373776f7264";
/// Cipher used for adopted external storage.
pub const EXTERNAL_VOLUME_CIPHER: &str = "aes-cbc-essiv:sha256";

#[derive(Error, Debug)]
pub enum CryptfsError {
    #[error(transparent)]
    Footer(#[from] FooterError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Kdf(#[from] KdfError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("crypto footer is marked inconsistent")]
    InconsistentState,
    #[error("device is not encrypted")]
    NotEncrypted,
    #[error("encrypted filesystem is not mounted yet")]
    NotUnlocked,
    #[error("inline crypto engine rejected the password")]
    HardwareRejected,
    #[error("cannot get size of {path}")]
    DeviceSize {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("key is {len} bytes, shorter than keysize {keysize}")]
    KeySize { len: usize, keysize: usize },
}

pub type Result<T, E = CryptfsError> = core::result::Result<T, E>;

/// Outcome of an unlock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Match,
    Mismatch { failed_attempts: u32 },
}

impl Verdict {
    pub fn is_match(self) -> bool {
        self == Verdict::Match
    }
}

/// Outcome of a password check while the data partition is mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reverify {
    Match,
    /// Wrong password, prompt again.
    Retry,
}

struct Session {
    device: PathBuf,
    /// `None` when the key lives in the inline engine.
    master_key: Option<MasterKey>,
}

/// Unlocks and re-verifies the encrypted data partition.
///
/// Holds no lock of its own; callers serialise unlock attempts.
pub struct Cryptfs {
    config: Config,
    footers: FooterStore,
    provisioner: Provisioner,
    oracle: Box<dyn SigningOracle>,
    inline: Box<dyn InlineCrypto>,
    mounter: Box<dyn Mounter>,
    props: Box<dyn PropertyStore>,
    mismatch_delay: Duration,
    session: OnceCell<Session>,
}

impl Cryptfs {
    /// Software-only defaults: no keystore, no inline engine, in-memory
    /// properties.
    pub fn new(config: Config) -> Self {
        Self {
            footers: FooterStore::new(config.key_location.clone(), &config.real_blkdev),
            provisioner: Provisioner::new(DeviceMapper::new(&config.device_mapper)),
            oracle: Box::new(NoKeystore),
            inline: Box::new(NoInlineCrypto),
            mounter: Box::new(SystemMounter),
            props: Box::new(MemoryProperties::default()),
            mismatch_delay: Duration::from_secs(1),
            session: OnceCell::new(),
            config,
        }
    }

    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Config::from_path(path)?))
    }

    pub fn with_provisioner(mut self, provisioner: Provisioner) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub fn with_oracle(mut self, oracle: impl SigningOracle + 'static) -> Self {
        self.oracle = Box::new(oracle);
        self
    }

    pub fn with_inline_crypto(mut self, inline: impl InlineCrypto + 'static) -> Self {
        self.inline = Box::new(inline);
        self
    }

    pub fn with_mounter(mut self, mounter: impl Mounter + 'static) -> Self {
        self.mounter = Box::new(mounter);
        self
    }

    pub fn with_properties(mut self, props: impl PropertyStore + 'static) -> Self {
        self.props = Box::new(props);
        self
    }

    /// Delay before a failed re-verify returns.
    pub fn with_mismatch_delay(mut self, delay: Duration) -> Self {
        self.mismatch_delay = delay;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn properties(&self) -> &dyn PropertyStore {
        self.props.as_ref()
    }

    pub fn footer(&self) -> Result<EncryptionFooter> {
        Ok(self.footers.load()?)
    }

    /// The decrypted block device, once a password has matched.
    pub fn crypto_blkdev(&self) -> Option<&Path> {
        self.session.get().map(|s| s.device.as_path())
    }

    fn is_encrypted(&self) -> bool {
        self.props.get(CRYPTO_STATE).as_deref() == Some("encrypted")
    }

    /// Checks `password` and, when it matches, leaves the data partition
    /// mapped at [`Cryptfs::crypto_blkdev`].
    #[tracing::instrument(skip_all, fields(label = %self.config.label))]
    pub fn check_password(&self, password: &[u8]) -> Result<Verdict> {
        if self.session.get().is_some() || !self.is_encrypted() {
            log::warn!("encrypted fs already validated or not running with encryption");
        }
        let mut footer = self.footers.load()?;

        if self.inline.is_hw_disk_encryption(&footer.cipher_name()) {
            return self.check_password_hw(&mut footer, password);
        }

        let verdict = match self.test_mount(&mut footer, password)? {
            Verdict::Match => Verdict::Match,
            Verdict::Mismatch { .. } => {
                // older releases handed the password over as hex
                let hex_password = to_hex_ascii(password, HexCase::Upper);
                self.test_mount(&mut footer, hex_password.as_bytes())?
            }
        };
        if !verdict.is_match() {
            log::info!("Password did not match");
        }
        Ok(verdict)
    }

    fn decrypt_master_key(
        &self,
        password: &[u8],
        footer: &EncryptionFooter,
    ) -> Result<(MasterKey, DerivedKey)> {
        let derived = kdf::derive(password, footer, self.oracle.as_ref())?;
        // always one cipher block, whatever keysize says
        let key = master_key::decrypt(&footer.master_key[..KEY_LEN_BYTES], &derived)?;
        Ok((key, derived))
    }

    fn test_mount(&self, footer: &mut EncryptionFooter, password: &[u8]) -> Result<Verdict> {
        log::debug!("crypt_ftr->fs_size = {}", footer.fs_size);
        let orig_failed_decrypt_count = footer.failed_decrypt_count;
        let unencrypted = footer.flags.contains(Flags::KEY_UNENCRYPTED);

        let (key, derived) = if unencrypted {
            (MasterKey::from_slice(footer.stored_master_key()), None)
        } else {
            match self.decrypt_master_key(password, footer) {
                Ok((key, derived)) => (key, Some(derived)),
                Err(e) => {
                    // still map the device, the trial mount decides
                    log::warn!("Failed to decrypt master key: {}", e);
                    (MasterKey::zeroed(footer.stored_master_key().len()), None)
                }
            }
        };

        let cipher = footer.cipher_name();
        let device = self.provisioner.create(&MappingRequest {
            label: &self.config.label,
            source: &self.config.real_blkdev,
            cipher: &cipher,
            key: key.as_bytes(),
            sectors: footer.fs_size,
            backend: CipherBackend::Software,
        })?;

        let key_matches = unencrypted
            || derived.map_or(false, |derived| {
                match kdf::harden(derived.intermediate(), &footer.salt, footer.cost()) {
                    Ok(hardened) => hardened[..]
                        .ct_eq(&footer.scrypted_intermediate_key[..])
                        .into(),
                    Err(e) => {
                        log::warn!("Cannot harden intermediate key: {}", e);
                        false
                    }
                }
            });

        if key_matches {
            log::info!("Password matches");
        } else {
            let scratch = self.config.scratch_mount_point();
            if let Err(e) = DirBuilder::new().mode(0o755).create(&scratch) {
                if e.kind() != io::ErrorKind::AlreadyExists {
                    log::warn!("Cannot create {}: {}", scratch.display(), e);
                }
            }
            match self
                .mounter
                .mount(&device.path, &scratch, &self.config.file_system)
            {
                Ok(()) => {
                    log::info!("Password did not match but decrypted drive mounted - continue");
                    if let Err(e) = self.mounter.unmount(&scratch) {
                        log::warn!("Cannot unmount {}: {}", scratch.display(), e);
                    }
                }
                Err(e) => {
                    log::error!(
                        "Error temp mounting decrypted block device '{}': {}",
                        device.path.display(),
                        e
                    );
                    if let Err(e) = self.provisioner.remove(&device.label) {
                        log::error!("{}", e);
                    }
                    footer.failed_decrypt_count = footer.failed_decrypt_count.saturating_add(1);
                    self.footers.store(footer)?;
                    return Ok(Verdict::Mismatch {
                        failed_attempts: footer.failed_decrypt_count,
                    });
                }
            }
        }

        footer.failed_decrypt_count = 0;
        if orig_failed_decrypt_count != 0 {
            self.footers.store(footer)?;
        }
        self.unlocked(device.path, Some(key));
        Ok(Verdict::Match)
    }

    fn unlocked(&self, device: PathBuf, master_key: Option<MasterKey>) {
        self.props.set(FS_CRYPTO_BLKDEV, &device.to_string_lossy());
        if self.session.set(Session { device, master_key }).is_err() {
            log::debug!("Keeping the master key of the first unlock");
        }
    }

    /// The password, or its keystore-bound form when the platform asks
    /// for one.
    fn hw_password(&self, footer: &EncryptionFooter, password: &[u8]) -> Option<DerivedKey> {
        if !self.inline.should_use_keymaster() {
            return None;
        }
        kdf::derive_with(KdfKind::ScryptKeymaster, password, footer, self.oracle.as_ref())
            .map_err(|e| log::error!("scrypt failed: {}", e))
            .ok()
    }

    fn verify_hw(&self, footer: &EncryptionFooter, password: &[u8]) -> Option<KeyIndex> {
        let bound = self.hw_password(footer, password);
        let material = bound.as_ref().map_or(password, DerivedKey::as_bytes);
        self.inline
            .set_key(material, &footer.cipher_name())
            .map_err(|e| log::debug!("{}", e))
            .ok()
    }

    /// Re-keys devices that were set up with a hex encoded password.
    fn migrate_hw(&self, footer: &mut EncryptionFooter, password: &[u8]) -> Option<KeyIndex> {
        let legacy = if footer.crypt_type == CryptType::Default.id() {
            Zeroizing::new(DEFAULT_HEX_PASSWORD.to_owned())
        } else {
            to_hex_ascii(password, HexCase::Lower)
        };
        let cipher = footer.cipher_name().into_owned();

        match self.inline.set_key(legacy.as_bytes(), &cipher) {
            Ok(key_index) => {
                footer.failed_decrypt_count = 0;
                log::info!("Hex password verified...will try to update with Ascii value");
                let bound = self.hw_password(footer, password);
                let new = bound.as_ref().map_or(password, DerivedKey::as_bytes);
                match self.inline.update_key(legacy.as_bytes(), new, &cipher) {
                    Ok(_) => {
                        footer.flags.insert(Flags::ASCII_PASSWORD_UPDATED);
                        log::info!("Ascii password recorded and updated");
                    }
                    Err(e) => {
                        log::warn!("Passwd verified, could not update ({})...Will try next time", e)
                    }
                }
                Some(key_index)
            }
            Err(_) => {
                footer.failed_decrypt_count = footer.failed_decrypt_count.saturating_add(1);
                None
            }
        }
    }

    fn verify_and_update_hw(
        &self,
        footer: &mut EncryptionFooter,
        password: &[u8],
    ) -> Result<Option<KeyIndex>> {
        let key_index = self.verify_hw(footer, password);
        let key_index = if footer.flags.contains(Flags::ASCII_PASSWORD_UPDATED) {
            log::debug!("Ascii password was updated");
            if key_index.is_none() {
                footer.failed_decrypt_count = footer.failed_decrypt_count.saturating_add(1);
            }
            key_index
        } else if key_index.is_some() {
            footer.flags.insert(Flags::ASCII_PASSWORD_UPDATED);
            key_index
        } else {
            self.migrate_hw(footer, password)
        };
        self.footers.store(footer)?;
        Ok(key_index)
    }

    fn check_password_hw(&self, footer: &mut EncryptionFooter, password: &[u8]) -> Result<Verdict> {
        let orig_failed_decrypt_count = footer.failed_decrypt_count;
        let key_index = match self.verify_and_update_hw(footer, password)? {
            Some(key_index) => key_index,
            None => {
                return Ok(Verdict::Mismatch {
                    failed_attempts: footer.failed_decrypt_count,
                })
            }
        };

        let ice = self.inline.ice_enabled();
        // the engine is addressed by key slot, dm-crypt never sees key material
        let key: Either<[u8; 4], MasterKey> = if ice {
            Either::Left(key_index.to_le_bytes())
        } else {
            Either::Right(MasterKey::zeroed(footer.stored_master_key().len()))
        };
        let fde_enabled = self.is_encrypted()
            || self
                .props
                .get(ENCRYPT_PROGRESS)
                .map_or(false, |progress| !progress.is_empty());

        let cipher = footer.cipher_name();
        let device = self.provisioner.create(&MappingRequest {
            label: &self.config.label,
            source: &self.config.real_blkdev,
            cipher: &cipher,
            key: AsRef::<[u8]>::as_ref(&key),
            sectors: footer.fs_size,
            backend: CipherBackend::HardwareOffload { fde_enabled, ice },
        })?;

        footer.failed_decrypt_count = 0;
        if orig_failed_decrypt_count != 0 {
            self.footers.store(footer)?;
        }
        self.unlocked(device.path, None);
        Ok(Verdict::Match)
    }

    /// Checks `password` against the unlocked data partition without
    /// touching the mapping.
    #[tracing::instrument(skip_all)]
    pub fn verify_password_on_mounted_device(&self, password: &[u8]) -> Result<Reverify> {
        if !self.is_encrypted() {
            return Err(CryptfsError::NotEncrypted);
        }
        let session = self.session.get().ok_or(CryptfsError::NotUnlocked)?;
        let footer = self.footers.load()?;

        if footer.flags.contains(Flags::KEY_UNENCRYPTED) {
            return Ok(Reverify::Match);
        }

        if self.inline.is_hw_disk_encryption(&footer.cipher_name()) {
            return match self.verify_hw(&footer, password) {
                Some(_) => Ok(Reverify::Match),
                None => Err(CryptfsError::HardwareRejected),
            };
        }

        let matches = match (self.decrypt_master_key(password, &footer), &session.master_key) {
            (Ok((candidate, _)), Some(saved)) => candidate.ct_eq(saved),
            _ => false,
        };
        if matches {
            Ok(Reverify::Match)
        } else {
            thread::sleep(self.mismatch_delay);
            Ok(Reverify::Retry)
        }
    }

    #[tracing::instrument(skip_all)]
    pub fn get_password_type(&self) -> Result<CryptType> {
        let footer = self.footers.load()?;
        if footer.flags.contains(Flags::INCONSISTENT_STATE) {
            return Err(CryptfsError::InconsistentState);
        }
        Ok(footer.password_type()?)
    }

    /// Maps an external volume whose key is kept elsewhere.
    #[tracing::instrument(skip(self, key))]
    pub fn setup_external_volume(
        &self,
        label: &str,
        real_blkdev: &Path,
        key: &[u8],
        keysize: usize,
    ) -> Result<PathBuf> {
        let size_error = |source| CryptfsError::DeviceSize {
            path: real_blkdev.to_owned(),
            source,
        };
        let file = File::open(real_blkdev).map_err(size_error)?;
        let sectors = blkdev::sector_count(&file).map_err(size_error)?;
        drop(file);
        if sectors == 0 {
            return Err(size_error(io::Error::new(
                io::ErrorKind::InvalidData,
                "zero sized device",
            )));
        }
        self.map_external_volume(label, real_blkdev, key, keysize, sectors)
    }

    fn map_external_volume(
        &self,
        label: &str,
        real_blkdev: &Path,
        key: &[u8],
        keysize: usize,
        sectors: u64,
    ) -> Result<PathBuf> {
        let key = key.get(..keysize).ok_or(CryptfsError::KeySize {
            len: key.len(),
            keysize,
        })?;
        let device = self.provisioner.create(&MappingRequest {
            label,
            source: real_blkdev,
            cipher: EXTERNAL_VOLUME_CIPHER,
            key,
            sectors,
            backend: CipherBackend::Software,
        })?;
        Ok(device.path)
    }

    #[tracing::instrument(skip(self))]
    pub fn revert_external_volume(&self, label: &str) -> Result<()> {
        Ok(self.provisioner.remove(label)?)
    }
}
