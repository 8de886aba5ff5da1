use std::io;
use std::os::fd::RawFd;

/// Executes the `ioctl` syscall on `fd` with `req`.
///
/// # Safety
///
/// `fd` must refer to an open file descriptor for the duration of the call.
pub unsafe fn exec<P>(fd: RawFd, code: libc::c_ulong, req: &mut Request<P>) -> io::Result<()> {
    let ret = unsafe { libc::ioctl(fd, code as _, req) };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// A control request addressed by interface name, as the `ifreq`/`ifr` family
/// of ioctls expects.
#[repr(C)]
pub struct Request<P> {
    name: [std::ffi::c_uchar; libc::IF_NAMESIZE],
    payload: P,
}

impl Request<SetTunFlagsPayload> {
    pub fn new_tun(name: &str) -> Self {
        Self {
            name: name_bytes(name),
            payload: SetTunFlagsPayload {
                flags: (libc::IFF_TUN | libc::IFF_NO_PI) as _,
            },
        }
    }
}

#[repr(C)]
pub struct SetTunFlagsPayload {
    flags: std::ffi::c_short,
}

/// Payload for `SIOCETHTOOL`, carrying a pointer to an ethtool command struct.
#[repr(C)]
pub struct EthtoolPayload {
    data: *mut std::ffi::c_void,
}

impl Request<EthtoolPayload> {
    pub fn new_ethtool(name: &str, data: *mut std::ffi::c_void) -> Self {
        Self {
            name: name_bytes(name),
            payload: EthtoolPayload { data },
        }
    }
}

fn name_bytes(name: &str) -> [std::ffi::c_uchar; libc::IF_NAMESIZE] {
    let name_as_bytes = name.as_bytes();
    debug_assert!(name_as_bytes.len() < libc::IF_NAMESIZE);

    let mut buf = [0u8; libc::IF_NAMESIZE];
    buf[..name_as_bytes.len()].copy_from_slice(name_as_bytes);
    buf
}
