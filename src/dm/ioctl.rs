//! The kernel side: `struct dm_ioctl` requests on `/dev/device-mapper`.

use super::{Connect, DmControl, TargetSpec, TargetVersion};
use std::fs::{File, OpenOptions};
use std::io;
use std::mem::size_of;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::ptr;
use zeroize::{Zeroize, ZeroizeOnDrop};

const DM_IOCTL: u8 = 0xfd;
const DM_VERSION: [u32; 3] = [4, 0, 0];
const DM_BUF_SIZE: usize = 4096;
const DM_NAME_LEN: usize = 128;
const DM_UUID_LEN: usize = 129;
const DM_MAX_TYPE_NAME: usize = 16;

#[repr(C)]
#[derive(Clone, Copy)]
struct DmIoctl {
    version: [u32; 3],
    data_size: u32,
    data_start: u32,
    target_count: u32,
    open_count: i32,
    flags: u32,
    event_nr: u32,
    padding: u32,
    dev: u64,
    name: [u8; DM_NAME_LEN],
    uuid: [u8; DM_UUID_LEN],
    data: [u8; 7],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct DmTargetSpec {
    sector_start: u64,
    length: u64,
    status: i32,
    next: u32,
    target_type: [u8; DM_MAX_TYPE_NAME],
}

// struct dm_target_versions: next, version[3], then the NUL terminated name
const VERSIONS_NAME_OFFSET: usize = 16;

nix::ioctl_readwrite!(dm_dev_create, DM_IOCTL, 3, DmIoctl);
nix::ioctl_readwrite!(dm_dev_remove, DM_IOCTL, 4, DmIoctl);
nix::ioctl_readwrite!(dm_dev_suspend, DM_IOCTL, 6, DmIoctl);
nix::ioctl_readwrite!(dm_dev_status, DM_IOCTL, 7, DmIoctl);
nix::ioctl_readwrite!(dm_table_load, DM_IOCTL, 9, DmIoctl);
nix::ioctl_readwrite!(dm_list_versions, DM_IOCTL, 13, DmIoctl);

const HEADER_LEN: usize = size_of::<DmIoctl>();
const SPEC_LEN: usize = size_of::<DmTargetSpec>();

/// Request buffer. Table loads carry the key, so it is wiped on drop.
#[repr(C, align(8))]
#[derive(Zeroize, ZeroizeOnDrop)]
struct Buffer([u8; DM_BUF_SIZE]);

impl Buffer {
    fn new(label: Option<&str>) -> io::Result<Self> {
        let mut header = DmIoctl {
            version: DM_VERSION,
            data_size: DM_BUF_SIZE as u32,
            data_start: HEADER_LEN as u32,
            target_count: 0,
            open_count: 0,
            flags: 0,
            event_nr: 0,
            padding: 0,
            dev: 0,
            name: [0; DM_NAME_LEN],
            uuid: [0; DM_UUID_LEN],
            data: [0; 7],
        };
        if let Some(label) = label {
            copy_name(&mut header.name, label)?;
        }
        let mut buf = Buffer([0; DM_BUF_SIZE]);
        buf.set_header(header);
        Ok(buf)
    }

    fn header(&self) -> DmIoctl {
        // SAFETY: the buffer is 8 byte aligned and longer than the header
        unsafe { ptr::read(self.0.as_ptr() as *const DmIoctl) }
    }

    fn set_header(&mut self, header: DmIoctl) {
        // SAFETY: as in `header`
        unsafe { ptr::write(self.0.as_mut_ptr() as *mut DmIoctl, header) }
    }

    fn as_request(&mut self) -> *mut DmIoctl {
        self.0.as_mut_ptr() as *mut DmIoctl
    }

    fn with_target(label: &str, target: &TargetSpec) -> io::Result<Self> {
        let mut buf = Buffer::new(Some(label))?;
        let params = target.params.as_bytes();
        let params_start = HEADER_LEN + SPEC_LEN;
        // params plus NUL, padded to 8 bytes
        let next = (SPEC_LEN + params.len() + 1 + 7) & !7;
        if HEADER_LEN + next > DM_BUF_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "dm table parameters too long",
            ));
        }

        let mut spec = DmTargetSpec {
            sector_start: target.sector_start,
            length: target.length,
            status: 0,
            next: next as u32,
            target_type: [0; DM_MAX_TYPE_NAME],
        };
        copy_name(&mut spec.target_type, target.target_type)?;
        // SAFETY: HEADER_LEN is a multiple of 8 and the spec fits, checked above
        unsafe { ptr::write(buf.0.as_mut_ptr().add(HEADER_LEN) as *mut DmTargetSpec, spec) };
        buf.0[params_start..params_start + params.len()].copy_from_slice(params);

        let mut header = buf.header();
        header.target_count = 1;
        buf.set_header(header);
        Ok(buf)
    }

    fn target_versions(&self) -> Vec<TargetVersion> {
        let header = self.header();
        let end = (header.data_size as usize).min(DM_BUF_SIZE);
        let mut offset = header.data_start as usize;
        let mut versions = Vec::new();
        while let Some(entry) = self.0.get(offset..end) {
            if entry.len() <= VERSIONS_NAME_OFFSET {
                break;
            }
            let word = |i: usize| {
                let mut b = [0u8; 4];
                b.copy_from_slice(&entry[i * 4..i * 4 + 4]);
                u32::from_ne_bytes(b)
            };
            let name = &entry[VERSIONS_NAME_OFFSET..];
            let name = &name[..name.iter().position(|&c| c == 0).unwrap_or(name.len())];
            versions.push(TargetVersion {
                name: String::from_utf8_lossy(name).into_owned(),
                version: [word(1), word(2), word(3)],
            });
            match word(0) as usize {
                0 => break,
                next => offset += next,
            }
        }
        versions
    }
}

fn copy_name(dst: &mut [u8], name: &str) -> io::Result<()> {
    let bytes = name.as_bytes();
    // keep room for the NUL
    if bytes.len() >= dst.len() || bytes.contains(&0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("dm name '{name}' does not fit"),
        ));
    }
    dst[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// The device-mapper control node.
#[derive(Debug, Clone)]
pub struct DeviceMapper {
    path: PathBuf,
}

impl DeviceMapper {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Connect for DeviceMapper {
    fn connect(&self) -> io::Result<Box<dyn DmControl + '_>> {
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        Ok(Box::new(Channel { file }))
    }
}

struct Channel {
    file: File,
}

type Request = unsafe fn(libc::c_int, *mut DmIoctl) -> nix::Result<libc::c_int>;

impl Channel {
    fn call(&mut self, request: Request, buf: &mut Buffer) -> io::Result<()> {
        // SAFETY: the buffer is a valid dm_ioctl header followed by
        // data_size - data_start bytes of payload space
        unsafe { request(self.file.as_raw_fd(), buf.as_request()) }?;
        Ok(())
    }

    fn simple(&mut self, request: Request, label: &str) -> io::Result<Buffer> {
        let mut buf = Buffer::new(Some(label))?;
        self.call(request, &mut buf)?;
        Ok(buf)
    }
}

impl DmControl for Channel {
    fn create(&mut self, label: &str) -> io::Result<()> {
        self.simple(dm_dev_create, label).map(drop)
    }

    fn status(&mut self, label: &str) -> io::Result<u64> {
        Ok(self.simple(dm_dev_status, label)?.header().dev)
    }

    fn target_versions(&mut self) -> io::Result<Vec<TargetVersion>> {
        let mut buf = Buffer::new(None)?;
        self.call(dm_list_versions, &mut buf)?;
        Ok(buf.target_versions())
    }

    fn load_table(&mut self, label: &str, target: &TargetSpec) -> io::Result<()> {
        let mut buf = Buffer::with_target(label, target)?;
        self.call(dm_table_load, &mut buf)
    }

    fn resume(&mut self, label: &str) -> io::Result<()> {
        // suspend without DM_SUSPEND_FLAG resumes
        self.simple(dm_dev_suspend, label).map(drop)
    }

    fn remove(&mut self, label: &str) -> io::Result<()> {
        self.simple(dm_dev_remove, label).map(drop)
    }
}
