use nix::mount::{mount, umount, MsFlags};
use std::io;
use std::path::Path;

/// Mounts the decrypted device for the trial mount.
pub trait Mounter {
    fn mount(&self, source: &Path, target: &Path, fstype: &str) -> io::Result<()>;
    fn unmount(&self, target: &Path) -> io::Result<()>;
}

#[derive(Debug, Default)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn mount(&self, source: &Path, target: &Path, fstype: &str) -> io::Result<()> {
        mount(
            Some(source),
            target,
            Some(fstype),
            MsFlags::empty(),
            None::<&str>,
        )
        .map_err(io::Error::from)
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        umount(target).map_err(io::Error::from)
    }
}
