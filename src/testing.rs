//! In-memory stand-ins for the kernel, the keystore and the inline engine.

use crate::config::{Config, KeyLocation};
use crate::dm::{self, Connect, DmControl, Provisioner, RetryPolicy, TargetSpec, TargetVersion};
use crate::footer::{EncryptionFooter, FooterStore};
use crate::inline::{InlineCrypto, InlineCryptoError, KeyIndex};
use crate::kdf::{self, KdfKind, ScryptCost};
use crate::keystore::{Signature, SigningError, SigningOracle, RSA_KEY_SIZE_BYTES};
use crate::master_key::{self, MasterKey};
use crate::mount::Mounter;
use crate::props::{MemoryProperties, CRYPTO_STATE};
use crate::verifier::Cryptfs;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tempfile::TempDir;
use zeroize::Zeroizing;

/// Cheap scrypt parameters, N = 16.
pub const TEST_COST: ScryptCost = ScryptCost {
    n_factor: 4,
    r_factor: 0,
    p_factor: 0,
};

pub const MASTER_KEY: [u8; 16] = *b"0123456789abcdef";
pub const CIPHER: &str = "aes-cbc-essiv:sha256";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedTable {
    pub target_type: String,
    pub length: u64,
    pub params: String,
}

#[derive(Debug)]
struct Mapping {
    dev: u64,
    table: Option<RecordedTable>,
    active: bool,
}

#[derive(Debug)]
struct MapperState {
    mappings: HashMap<String, Mapping>,
    next_minor: u64,
    reject_loads: u32,
    crypt_version: [u32; 3],
    removed: Vec<String>,
}

/// Device-mapper in memory. Clones share state.
#[derive(Debug, Clone)]
pub struct FakeMapper(Arc<Mutex<MapperState>>);

impl Default for FakeMapper {
    fn default() -> Self {
        Self::with_crypt_version([1, 19, 0])
    }
}

impl FakeMapper {
    pub fn with_crypt_version(crypt_version: [u32; 3]) -> Self {
        Self(Arc::new(Mutex::new(MapperState {
            mappings: HashMap::new(),
            next_minor: 0,
            reject_loads: 0,
            crypt_version,
            removed: Vec::new(),
        })))
    }

    /// The next `n` table loads fail with `EBUSY`.
    pub fn reject_loads(&self, n: u32) {
        lock(&self.0).reject_loads = n;
    }

    pub fn exists(&self, label: &str) -> bool {
        lock(&self.0).mappings.contains_key(label)
    }

    pub fn is_active(&self, label: &str) -> bool {
        lock(&self.0)
            .mappings
            .get(label)
            .map_or(false, |m| m.active)
    }

    pub fn table(&self, label: &str) -> Option<RecordedTable> {
        lock(&self.0).mappings.get(label)?.table.clone()
    }

    pub fn device_path(&self, label: &str) -> Option<PathBuf> {
        let dev = lock(&self.0).mappings.get(label)?.dev;
        Some(dm::device_path(dm::minor(dev)))
    }

    pub fn removed(&self) -> Vec<String> {
        lock(&self.0).removed.clone()
    }
}

fn no_such_device(label: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no mapping {label}"))
}

impl Connect for FakeMapper {
    fn connect(&self) -> io::Result<Box<dyn DmControl + '_>> {
        Ok(Box::new(self.clone()))
    }
}

impl DmControl for FakeMapper {
    fn create(&mut self, label: &str) -> io::Result<()> {
        let mut state = lock(&self.0);
        if state.mappings.contains_key(label) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "EBUSY"));
        }
        let minor = state.next_minor;
        state.next_minor += 1;
        // major 253, minor split the way the kernel encodes it
        let dev = (253 << 8) | (minor & 0xff) | ((minor & !0xff) << 12);
        state.mappings.insert(
            label.to_owned(),
            Mapping {
                dev,
                table: None,
                active: false,
            },
        );
        Ok(())
    }

    fn status(&mut self, label: &str) -> io::Result<u64> {
        lock(&self.0)
            .mappings
            .get(label)
            .map(|m| m.dev)
            .ok_or_else(|| no_such_device(label))
    }

    fn target_versions(&mut self) -> io::Result<Vec<TargetVersion>> {
        Ok(vec![
            TargetVersion {
                name: "linear".into(),
                version: [1, 4, 0],
            },
            TargetVersion {
                name: "crypt".into(),
                version: lock(&self.0).crypt_version,
            },
        ])
    }

    fn load_table(&mut self, label: &str, target: &TargetSpec) -> io::Result<()> {
        let mut state = lock(&self.0);
        if state.reject_loads > 0 {
            state.reject_loads -= 1;
            return Err(io::Error::new(io::ErrorKind::Other, "EBUSY"));
        }
        let mapping = state
            .mappings
            .get_mut(label)
            .ok_or_else(|| no_such_device(label))?;
        mapping.table = Some(RecordedTable {
            target_type: target.target_type.to_owned(),
            length: target.length,
            params: target.params.to_string(),
        });
        Ok(())
    }

    fn resume(&mut self, label: &str) -> io::Result<()> {
        let mut state = lock(&self.0);
        let mapping = state
            .mappings
            .get_mut(label)
            .ok_or_else(|| no_such_device(label))?;
        if mapping.table.is_none() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "no table"));
        }
        mapping.active = true;
        Ok(())
    }

    fn remove(&mut self, label: &str) -> io::Result<()> {
        let mut state = lock(&self.0);
        state
            .mappings
            .remove(label)
            .ok_or_else(|| no_such_device(label))?;
        state.removed.push(label.to_owned());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MountState {
    succeed: bool,
    mounts: Vec<(PathBuf, PathBuf, String)>,
    unmounts: Vec<PathBuf>,
}

/// Mounts fail unless built with [`FakeMounter::succeeding`].
#[derive(Debug, Clone, Default)]
pub struct FakeMounter(Arc<Mutex<MountState>>);

impl FakeMounter {
    pub fn succeeding() -> Self {
        let mounter = Self::default();
        lock(&mounter.0).succeed = true;
        mounter
    }

    pub fn mounts(&self) -> Vec<(PathBuf, PathBuf, String)> {
        lock(&self.0).mounts.clone()
    }

    pub fn unmounts(&self) -> Vec<PathBuf> {
        lock(&self.0).unmounts.clone()
    }
}

impl Mounter for FakeMounter {
    fn mount(&self, source: &Path, target: &Path, fstype: &str) -> io::Result<()> {
        let mut state = lock(&self.0);
        state
            .mounts
            .push((source.to_owned(), target.to_owned(), fstype.to_owned()));
        if state.succeed {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::InvalidData, "bad superblock"))
        }
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        lock(&self.0).unmounts.push(target.to_owned());
        Ok(())
    }
}

/// Deterministic keystore: the signature is a hash of blob and block.
#[derive(Debug, Clone, Default)]
pub struct FakeOracle {
    calls: Arc<AtomicUsize>,
    rate_limits: Arc<AtomicUsize>,
}

impl FakeOracle {
    /// The first `n` requests are rate limited.
    pub fn rate_limited(n: usize) -> Self {
        let oracle = Self::default();
        oracle.rate_limits.store(n, Ordering::SeqCst);
        oracle
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn expected(&self, key_blob: &[u8], block: &[u8]) -> Signature {
        let mut out = Zeroizing::new(Vec::with_capacity(RSA_KEY_SIZE_BYTES));
        for round in 0..(RSA_KEY_SIZE_BYTES / 32) as u8 {
            let digest = Sha256::new()
                .chain_update([round])
                .chain_update(key_blob)
                .chain_update(block)
                .finalize();
            out.extend_from_slice(&digest);
        }
        out
    }
}

impl SigningOracle for FakeOracle {
    fn sign_block(&self, key_blob: &[u8], block: &[u8]) -> Result<Signature, SigningError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let limited = self
            .rate_limits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if limited {
            return Err(SigningError::RateLimited);
        }
        Ok(self.expected(key_blob, block))
    }
}

#[derive(Debug, Default)]
struct InlineState {
    hardware: bool,
    ice: bool,
    keymaster: bool,
    accepted: Vec<Vec<u8>>,
    attempts: Vec<Vec<u8>>,
    updates: Vec<(Vec<u8>, Vec<u8>)>,
    refuse_updates: bool,
}

/// Inline engine holding a set of accepted passwords.
#[derive(Debug, Clone, Default)]
pub struct FakeInline(Arc<Mutex<InlineState>>);

impl FakeInline {
    pub fn hardware(ice: bool) -> Self {
        let inline = Self::default();
        {
            let mut state = lock(&inline.0);
            state.hardware = true;
            state.ice = ice;
        }
        inline
    }

    pub fn with_keymaster(self) -> Self {
        lock(&self.0).keymaster = true;
        self
    }

    pub fn refusing_updates(self) -> Self {
        lock(&self.0).refuse_updates = true;
        self
    }

    pub fn accept(&self, material: &[u8]) {
        lock(&self.0).accepted.push(material.to_vec());
    }

    pub fn attempts(&self) -> Vec<Vec<u8>> {
        lock(&self.0).attempts.clone()
    }

    pub fn updates(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        lock(&self.0).updates.clone()
    }
}

impl InlineCrypto for FakeInline {
    fn is_hw_disk_encryption(&self, _cipher: &str) -> bool {
        lock(&self.0).hardware
    }

    fn ice_enabled(&self) -> bool {
        lock(&self.0).ice
    }

    fn should_use_keymaster(&self) -> bool {
        lock(&self.0).keymaster
    }

    fn set_key(&self, material: &[u8], _cipher: &str) -> Result<KeyIndex, InlineCryptoError> {
        let mut state = lock(&self.0);
        state.attempts.push(material.to_vec());
        state
            .accepted
            .iter()
            .position(|k| k == material)
            .map(|i| i as KeyIndex + 1)
            .ok_or(InlineCryptoError::Rejected)
    }

    fn update_key(
        &self,
        old: &[u8],
        new: &[u8],
        _cipher: &str,
    ) -> Result<KeyIndex, InlineCryptoError> {
        let mut state = lock(&self.0);
        if state.refuse_updates {
            return Err(InlineCryptoError::Rejected);
        }
        state.updates.push((old.to_vec(), new.to_vec()));
        let slot = state
            .accepted
            .iter()
            .position(|k| k == old)
            .ok_or(InlineCryptoError::Rejected)?;
        state.accepted[slot] = new.to_vec();
        Ok(slot as KeyIndex + 1)
    }
}

/// A footer protecting [`MASTER_KEY`] with `password`.
pub fn enroll(password: &[u8], kind: KdfKind, oracle: &dyn SigningOracle) -> EncryptionFooter {
    let mut footer = EncryptionFooter {
        keysize: MASTER_KEY.len() as u32,
        kdf_type: kind.id(),
        n_factor: TEST_COST.n_factor,
        r_factor: TEST_COST.r_factor,
        p_factor: TEST_COST.p_factor,
        salt: [0x11; 16],
        fs_size: 4096,
        ..Default::default()
    };
    footer.set_cipher_name(CIPHER).unwrap();
    footer.set_key_blob(b"test key blob").unwrap();

    let derived = kdf::derive(password, &footer, oracle).unwrap();
    let wrapped = master_key::encrypt(&MasterKey::from_slice(&MASTER_KEY), &derived).unwrap();
    footer.master_key[..wrapped.len()].copy_from_slice(&wrapped);
    footer.scrypted_intermediate_key =
        *kdf::harden(derived.intermediate(), &footer.salt, footer.cost()).unwrap();
    footer
}

/// A scratch directory with a key file and fakes for everything else.
pub struct Harness {
    pub dir: TempDir,
    pub config: Config,
    pub mapper: FakeMapper,
    pub mounter: FakeMounter,
    pub oracle: FakeOracle,
    pub inline: FakeInline,
}

impl Harness {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            key_location: KeyLocation::File(dir.path().join("key_file")),
            real_blkdev: dir.path().join("userdata.img"),
            mount_point: dir.path().to_owned(),
            ..Default::default()
        };
        Self {
            dir,
            config,
            mapper: FakeMapper::default(),
            mounter: FakeMounter::default(),
            oracle: FakeOracle::default(),
            inline: FakeInline::default(),
        }
    }

    fn store(&self) -> FooterStore {
        FooterStore::new(self.config.key_location.clone(), &self.config.real_blkdev)
    }

    pub fn write_footer(&self, footer: &mut EncryptionFooter) {
        self.store().store(footer).unwrap();
    }

    pub fn read_footer(&self) -> EncryptionFooter {
        self.store().load().unwrap()
    }

    pub fn cryptfs(&self) -> Cryptfs {
        let provisioner = Provisioner::new(self.mapper.clone()).with_retry(RetryPolicy {
            attempts: 10,
            delay: Duration::ZERO,
        });
        Cryptfs::new(self.config.clone())
            .with_provisioner(provisioner)
            .with_oracle(self.oracle.clone())
            .with_inline_crypto(self.inline.clone())
            .with_mounter(self.mounter.clone())
            .with_properties(MemoryProperties::default().with(CRYPTO_STATE, "encrypted"))
            .with_mismatch_delay(Duration::ZERO)
    }
}
