//! tap / macvtap character devices.

use std::fs::{File, OpenOptions};
use std::io;
use std::mem;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const TUNGETIFF: libc::c_ulong = 0x8004_54d2;
const TUNGETVNETHDRSZ: libc::c_ulong = 0x8004_54d7;

const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFF_VNET_HDR: libc::c_short = 0x4000;

const TUN_CLONE_DEVICE: &str = "/dev/net/tun";

#[repr(C)]
struct IfReq {
    name: [u8; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

fn open_nonblocking(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
        .open(path)
}

/// Size of the virtio-net header the device prepends to every frame, or
/// zero if it was opened without `IFF_VNET_HDR`.
pub fn vnet_header_size(file: &File) -> io::Result<usize> {
    let mut req: IfReq = unsafe { mem::zeroed() };
    if unsafe { libc::ioctl(file.as_raw_fd(), TUNGETIFF as _, &mut req) } < 0 {
        return Err(io::Error::last_os_error());
    }
    if req.flags & IFF_VNET_HDR == 0 {
        return Ok(0);
    }

    let mut size: libc::c_int = 0;
    if unsafe { libc::ioctl(file.as_raw_fd(), TUNGETVNETHDRSZ as _, &mut size) } < 0 {
        return Err(io::Error::last_os_error());
    }
    usize::try_from(size).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "negative vnet header size"))
}

/// Open an existing device node such as `/dev/tap7` (macvtap).
pub fn open_tap(path: &Path) -> io::Result<(File, usize)> {
    let file = open_nonblocking(path)?;
    let header = vnet_header_size(&file)?;
    Ok((file, header))
}

/// Create or attach to the tap interface `name` through the clone device.
pub fn create_tap(name: &str) -> io::Result<(File, usize)> {
    let mut req: IfReq = unsafe { mem::zeroed() };
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() >= req.name.len() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid interface name"));
    }
    req.name[..bytes.len()].copy_from_slice(bytes);
    req.flags = IFF_TAP | IFF_NO_PI | IFF_VNET_HDR;

    let file = open_nonblocking(Path::new(TUN_CLONE_DEVICE))?;
    if unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req) } < 0 {
        return Err(io::Error::last_os_error());
    }
    let header = vnet_header_size(&file)?;
    Ok((file, header))
}
