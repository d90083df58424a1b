use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Sentinel meaning "the footer sits at the end of the raw block device".
pub const KEY_IN_FOOTER: &str = "footer";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file `{path}`")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file `{path}`")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

pub type Result<T, E = ConfigError> = core::result::Result<T, E>;

/// Where the crypto footer is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum KeyLocation {
    Footer,
    File(PathBuf),
}

impl From<String> for KeyLocation {
    fn from(value: String) -> Self {
        match value.as_str() {
            KEY_IN_FOOTER => KeyLocation::Footer,
            _ => KeyLocation::File(PathBuf::from(value)),
        }
    }
}

impl From<KeyLocation> for String {
    fn from(value: KeyLocation) -> Self {
        value.to_string()
    }
}

impl FromStr for KeyLocation {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(s.to_owned().into())
    }
}

impl fmt::Display for KeyLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyLocation::Footer => f.write_str(KEY_IN_FOOTER),
            KeyLocation::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// `footer` or an absolute path to a dedicated key file
    pub key_location: KeyLocation,
    /// Raw encrypted partition
    pub real_blkdev: PathBuf,
    /// Filesystem type used for the trial mount
    pub file_system: String,
    /// The trial mount happens under `<mount_point>/tmp_mnt`
    pub mount_point: PathBuf,
    /// Name of the device-mapper mapping
    pub label: String,
    /// Device-mapper control node
    pub device_mapper: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            key_location: KeyLocation::Footer,
            real_blkdev: PathBuf::from("/dev/block/bootdevice/by-name/userdata"),
            file_system: "ext4".to_owned(),
            mount_point: PathBuf::from("/data"),
            label: "userdata".to_owned(),
            device_mapper: PathBuf::from("/dev/device-mapper"),
        }
    }
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    pub fn scratch_mount_point(&self) -> PathBuf {
        self.mount_point.join("tmp_mnt")
    }
}
