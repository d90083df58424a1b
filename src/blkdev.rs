use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

// BLKGETSIZE, the device size in 512 byte sectors
nix::ioctl_read_bad!(blk_get_size, nix::request_code_none!(0x12, 96), libc::c_ulong);

/// Number of 512 byte sectors on the block device behind `file`.
///
/// Fails for anything that is not a block device.
pub fn sector_count(file: &File) -> io::Result<u64> {
    let mut sectors: libc::c_ulong = 0;
    // SAFETY: BLKGETSIZE writes a single unsigned long through the pointer.
    unsafe { blk_get_size(file.as_raw_fd(), &mut sectors) }.map_err(io::Error::from)?;
    Ok(sectors as u64)
}
