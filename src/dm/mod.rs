//! Provisioning dm-crypt mappings through the device-mapper control node.

use std::fmt::Write;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use zeroize::Zeroizing;

mod ioctl;

pub use ioctl::DeviceMapper;

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("cannot open device-mapper control")]
    Open(#[source] io::Error),
    #[error("cannot create dm-crypt device {label}")]
    Create {
        label: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot retrieve status of dm-crypt device {label}")]
    Status {
        label: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot load dm-crypt mapping table for {label} after {attempts} attempts")]
    LoadTable {
        label: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("cannot resume dm-crypt device {label}")]
    Resume {
        label: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot remove dm-crypt device {label}")]
    Remove {
        label: String,
        #[source]
        source: io::Error,
    },
}

pub type Result<T, E = ProvisionError> = core::result::Result<T, E>;

/// A target driver registered with the kernel and its version triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetVersion {
    pub name: String,
    pub version: [u32; 3],
}

/// A single-target table.
#[derive(Debug, PartialEq, Eq)]
pub struct TargetSpec {
    pub sector_start: u64,
    pub length: u64,
    pub target_type: &'static str,
    pub params: Zeroizing<String>,
}

/// One open control channel. Every call addresses a mapping by name.
pub trait DmControl {
    fn create(&mut self, label: &str) -> io::Result<()>;
    /// Returns the encoded device number of the mapping.
    fn status(&mut self, label: &str) -> io::Result<u64>;
    fn target_versions(&mut self) -> io::Result<Vec<TargetVersion>>;
    fn load_table(&mut self, label: &str, target: &TargetSpec) -> io::Result<()>;
    /// Activates the loaded table.
    fn resume(&mut self, label: &str) -> io::Result<()>;
    fn remove(&mut self, label: &str) -> io::Result<()>;
}

/// Opens control channels.
pub trait Connect {
    fn connect(&self) -> io::Result<Box<dyn DmControl + '_>>;
}

/// Which target driver serves the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherBackend {
    /// `crypt`, with discards when the driver supports them
    Software,
    /// `req-crypt`, keyed by the inline crypto engine
    HardwareOffload { fde_enabled: bool, ice: bool },
}

impl CipherBackend {
    fn target_type(self) -> &'static str {
        match self {
            CipherBackend::Software => "crypt",
            CipherBackend::HardwareOffload { .. } => "req-crypt",
        }
    }
}

pub struct MappingRequest<'a> {
    pub label: &'a str,
    pub source: &'a Path,
    pub cipher: &'a str,
    /// Raw key bytes, written into the table as lowercase hex.
    pub key: &'a [u8],
    /// Length of the mapping in 512 byte sectors.
    pub sectors: u64,
    pub backend: CipherBackend,
}

/// A live mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoDevice {
    pub label: String,
    pub path: PathBuf,
    /// How many table loads it took, for diagnostics.
    pub table_load_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_millis(500),
        }
    }
}

/// Device number to minor, as the kernel's `new_decode_dev` does.
pub fn minor(dev: u64) -> u32 {
    ((dev & 0xff) | ((dev >> 12) & 0xfff00)) as u32
}

pub fn device_path(minor: u32) -> PathBuf {
    PathBuf::from(format!("/dev/block/dm-{minor}"))
}

/// Discards were added to dm-crypt in 1.11.0.
pub fn supports_discards(versions: &[TargetVersion]) -> bool {
    versions
        .iter()
        .find(|v| v.name == "crypt")
        .map(|v| (v.version[0], v.version[1]) >= (1, 11))
        .unwrap_or(false)
}

/// Builds `"<cipher> <hex key> 0 <source> 0 <extra> 0"` in one allocation so
/// the hex key is never left behind in a freed buffer.
pub fn table_params(cipher: &str, key: &[u8], source: &Path, extra: &str) -> Zeroizing<String> {
    let source = source.to_string_lossy();
    let len = cipher.len() + 2 * key.len() + source.len() + extra.len() + 9;
    let mut params = Zeroizing::new(String::with_capacity(len));
    // writing to a String cannot fail
    let _ = write!(params, "{cipher} ");
    for byte in key {
        let _ = write!(params, "{byte:02x}");
    }
    let _ = write!(params, " 0 {source} 0 {extra} 0");
    debug_assert_eq!(params.len(), len);
    params
}

/// Removes the mapping when dropped unless committed.
struct PendingMapping<'a, 'c> {
    channel: &'a mut (dyn DmControl + 'c),
    label: &'a str,
    committed: bool,
}

impl Drop for PendingMapping<'_, '_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = self.channel.remove(self.label) {
            log::error!("Cannot remove half-built dm-crypt device {}: {}", self.label, e);
        }
    }
}

pub struct Provisioner {
    control: Box<dyn Connect>,
    retry: RetryPolicy,
}

impl Provisioner {
    pub fn new(control: impl Connect + 'static) -> Self {
        Self {
            control: Box::new(control),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Creates, loads and activates a mapping. A failure after the mapping
    /// was created removes it again.
    pub fn create(&self, request: &MappingRequest) -> Result<CryptoDevice> {
        let mut channel = self.control.connect().map_err(ProvisionError::Open)?;
        let label = request.label;

        channel
            .create(label)
            .map_err(|source| ProvisionError::Create {
                label: label.to_owned(),
                source,
            })?;
        let mut pending = PendingMapping {
            channel: channel.as_mut(),
            label,
            committed: false,
        };

        let dev = pending
            .channel
            .status(label)
            .map_err(|source| ProvisionError::Status {
                label: label.to_owned(),
                source,
            })?;
        let path = device_path(minor(dev));

        let extra = match request.backend {
            CipherBackend::HardwareOffload { fde_enabled, ice } => match (fde_enabled, ice) {
                (true, true) => "fde_enabled ice",
                (true, false) => "fde_enabled",
                (false, _) => "fde_disabled",
            },
            CipherBackend::Software => match pending.channel.target_versions() {
                Ok(versions) if supports_discards(&versions) => {
                    log::info!("Enabling support for allow_discards in dmcrypt.");
                    "1 allow_discards"
                }
                Ok(_) => "",
                Err(e) => {
                    log::debug!("Cannot list dm target versions: {}", e);
                    ""
                }
            },
        };

        let target = TargetSpec {
            sector_start: 0,
            length: request.sectors,
            target_type: request.backend.target_type(),
            params: table_params(request.cipher, request.key, request.source, extra),
        };
        log::debug!(
            "target_type = {}, real_blk_name = {}, extra_params = {}",
            target.target_type,
            request.source.display(),
            extra
        );

        let attempts = self.load_table(&mut *pending.channel, label, &target)?;
        if attempts > 1 {
            log::info!("Took {} tries to load dmcrypt table.", attempts);
        }

        pending
            .channel
            .resume(label)
            .map_err(|source| ProvisionError::Resume {
                label: label.to_owned(),
                source,
            })?;
        pending.committed = true;

        Ok(CryptoDevice {
            label: label.to_owned(),
            path,
            table_load_attempts: attempts,
        })
    }

    fn load_table(
        &self,
        channel: &mut (dyn DmControl + '_),
        label: &str,
        target: &TargetSpec,
    ) -> Result<u32> {
        let mut attempt = 1;
        loop {
            match channel.load_table(label, target) {
                Ok(()) => return Ok(attempt),
                Err(source) if attempt >= self.retry.attempts => {
                    return Err(ProvisionError::LoadTable {
                        label: label.to_owned(),
                        attempts: attempt,
                        source,
                    })
                }
                Err(e) => {
                    log::debug!("Table load attempt {} for {} failed: {}", attempt, label, e);
                    thread::sleep(self.retry.delay);
                    attempt += 1;
                }
            }
        }
    }

    /// Removing a mapping that does not exist is an error.
    pub fn remove(&self, label: &str) -> Result<()> {
        let mut channel = self.control.connect().map_err(ProvisionError::Open)?;
        channel
            .remove(label)
            .map_err(|source| ProvisionError::Remove {
                label: label.to_owned(),
                source,
            })
    }
}
