use super::{EncryptionFooter, FooterError, Result, CURRENT_MINOR_VERSION, FOOTER_LEN};
use crate::blkdev;
use crate::config::KeyLocation;
use once_cell::sync::OnceCell;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// The footer lives in the last 16 KiB of the raw partition.
pub const CRYPT_FOOTER_OFFSET: u64 = 0x4000;
/// A dedicated key file is exactly this long.
pub const KEY_FILE_LEN: u64 = 0x4000;

const SECTOR_SIZE: u64 = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FooterLocation {
    pub path: PathBuf,
    pub offset: u64,
}

/// Reads and writes the footer at its resolved location.
///
/// The location is resolved once and cached for the lifetime of the store.
#[derive(Debug)]
pub struct FooterStore {
    key_location: KeyLocation,
    real_blkdev: PathBuf,
    location: OnceCell<FooterLocation>,
}

/// Byte offset of the footer on a device of `sectors` 512 byte sectors.
fn footer_offset(sectors: u64) -> Option<u64> {
    sectors
        .checked_mul(SECTOR_SIZE)?
        .checked_sub(CRYPT_FOOTER_OFFSET)
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> FooterError + '_ {
    move |source| FooterError::Io {
        path: path.to_owned(),
        source,
    }
}

impl FooterStore {
    pub fn new(key_location: KeyLocation, real_blkdev: impl Into<PathBuf>) -> Self {
        Self {
            key_location,
            real_blkdev: real_blkdev.into(),
            location: OnceCell::new(),
        }
    }

    pub fn locate(&self) -> Result<&FooterLocation> {
        self.location.get_or_try_init(|| self.resolve())
    }

    fn resolve(&self) -> Result<FooterLocation> {
        log::debug!("crypto key location: '{}'", self.key_location);
        match &self.key_location {
            KeyLocation::Footer => {
                let path = &self.real_blkdev;
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path)
                    .map_err(io_error(path))?;
                let sectors = blkdev::sector_count(&file).map_err(io_error(path))?;
                let offset = footer_offset(sectors).ok_or_else(|| {
                    io_error(path)(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("block device too small ({sectors} sectors)"),
                    ))
                })?;
                Ok(FooterLocation {
                    path: path.clone(),
                    offset,
                })
            }
            KeyLocation::File(path) => Ok(FooterLocation {
                path: path.clone(),
                offset: 0,
            }),
        }
    }

    fn located_absolute(&self) -> Result<&FooterLocation> {
        let location = self.locate()?;
        if !location.path.is_absolute() {
            return Err(FooterError::Config(location.path.clone()));
        }
        Ok(location)
    }

    pub fn load(&self) -> Result<EncryptionFooter> {
        let FooterLocation { path, offset } = self.located_absolute()?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(io_error(path))?;

        let metadata = file.metadata().map_err(io_error(path))?;
        if metadata.is_file() && metadata.len() != KEY_FILE_LEN {
            return Err(FooterError::BadKeyFileSize {
                path: path.clone(),
                len: metadata.len(),
                expected: KEY_FILE_LEN,
            });
        }

        let mut buf = [0u8; FOOTER_LEN];
        file.seek(SeekFrom::Start(*offset))
            .and_then(|_| file.read_exact(&mut buf))
            .map_err(io_error(path))?;

        let footer = EncryptionFooter::from_bytes(&buf)?;
        footer.check_version()?;
        if footer.minor_version > CURRENT_MINOR_VERSION {
            log::warn!(
                "crypto footer minor version {}, expected <= {}, continuing...",
                footer.minor_version,
                CURRENT_MINOR_VERSION
            );
        }
        Ok(footer)
    }

    /// Seals the footer with a fresh checksum and writes it back.
    ///
    /// The in-memory footer keeps its mutations if the write fails.
    pub fn store(&self, footer: &mut EncryptionFooter) -> Result<()> {
        footer.seal()?;
        let bytes = footer.to_bytes()?;
        let FooterLocation { path, offset } = self.located_absolute()?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .open(path)
            .map_err(io_error(path))?;

        file.seek(SeekFrom::Start(*offset))
            .and_then(|_| file.write_all(&bytes))
            .map_err(io_error(path))?;

        // never resize a raw block device
        if is_regular(&file).map_err(io_error(path))? {
            file.set_len(KEY_FILE_LEN).map_err(io_error(path))?;
        }
        Ok(())
    }
}

fn is_regular(file: &File) -> io::Result<bool> {
    Ok(file.metadata()?.is_file())
}
