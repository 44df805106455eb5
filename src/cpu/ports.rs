use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use log::{trace, warn};

use super::Context;
use crate::machine::Machine;

/// Host-level port I/O. `size` is 1, 2 or 4 bytes.
pub trait PortIo {
    fn inport(&mut self, port: u16, size: u8) -> u32;
    fn outport(&mut self, port: u16, size: u8, value: u32);
}

enum Device {
    Unopened,
    Open(OwnedFd),
    Unavailable,
}

/// Real port access through a device such as `/dev/port`, where the file
/// offset is the port number.
pub struct HostPorts {
    path: PathBuf,
    device: Device,
}

fn all_ones(size: u8) -> u32 {
    match size {
        1 => 0xff,
        2 => 0xffff,
        _ => 0xffff_ffff,
    }
}

impl HostPorts {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            device: Device::Unopened,
        }
    }

    fn open(&self) -> io::Result<OwnedFd> {
        let path = CString::new(self.path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    fn fd(&mut self) -> Option<i32> {
        if let Device::Unopened = self.device {
            self.device = match self.open() {
                Ok(fd) => Device::Open(fd),
                Err(err) => {
                    warn!(target: "io", "port access through {} unavailable: {err}", self.path.display());
                    Device::Unavailable
                }
            };
        }
        match &self.device {
            Device::Open(fd) => Some(fd.as_raw_fd()),
            _ => None,
        }
    }
}

impl PortIo for HostPorts {
    fn inport(&mut self, port: u16, size: u8) -> u32 {
        let Some(fd) = self.fd() else {
            return all_ones(size);
        };
        let mut buf = [0u8; 4];
        let len = usize::from(size.min(4));
        let res = unsafe {
            libc::pread(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                len,
                libc::off_t::from(port),
            )
        };
        if res != len as isize {
            return all_ones(size);
        }
        u32::from_le_bytes(buf)
    }

    fn outport(&mut self, port: u16, size: u8, value: u32) {
        let Some(fd) = self.fd() else {
            return;
        };
        let buf = value.to_le_bytes();
        let len = usize::from(size.min(4));
        let res = unsafe {
            libc::pwrite(
                fd,
                buf.as_ptr() as *const libc::c_void,
                len,
                libc::off_t::from(port),
            )
        };
        if res != len as isize {
            warn!(target: "io", "write of port {port:#x} failed: {}", io::Error::last_os_error());
        }
    }
}

fn hex(value: u32, size: u8) -> String {
    match size {
        1 => format!("{:02x}", value as u8),
        2 => format!("{:04x}", value as u16),
        _ => format!("{value:08x}"),
    }
}

impl Machine {
    pub(crate) fn inport(&mut self, ctx: &Context, port: u16, size: u8) -> u32 {
        let value = self.ports.inport(port, size) & all_ones(size);
        trace!(target: "io", "{port:#x} < {} @ {:04x}:{:04x}", hex(value, size), ctx.cs(), ctx.eip as u16);
        value
    }

    pub(crate) fn outport(&mut self, ctx: &Context, port: u16, size: u8, value: u32) {
        let value = value & all_ones(size);
        trace!(target: "io", "{port:#x} > {} @ {:04x}:{:04x}", hex(value, size), ctx.cs(), ctx.eip as u16);
        self.ports.outport(port, size, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_device_reads_all_ones() {
        let mut ports = HostPorts::new(PathBuf::from("/nonexistent/port"));
        assert_eq!(ports.inport(0x60, 1), 0xff);
        assert_eq!(ports.inport(0x60, 2), 0xffff);
        ports.outport(0x80, 1, 0x12);
        assert!(matches!(ports.device, Device::Unavailable));
    }

    #[test]
    fn ports_are_file_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("port");
        std::fs::write(&path, vec![0u8; 0x400]).unwrap();

        let mut ports = HostPorts::new(path);
        ports.outport(0x3f8, 2, 0xbeef);
        assert_eq!(ports.inport(0x3f8, 1), 0xef);
        assert_eq!(ports.inport(0x3f8, 2), 0xbeef);
    }

    #[test]
    fn values_are_printed_by_size() {
        assert_eq!(hex(0x41, 1), "41");
        assert_eq!(hex(0x41, 2), "0041");
        assert_eq!(hex(0x41, 4), "00000041");
    }
}
