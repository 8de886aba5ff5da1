use crate::Error;
use socket2::Socket;
use std::os::fd::AsRawFd;

#[cfg(target_os = "linux")]
pub(crate) fn bind_to_device(interface: &str, _network: &str, socket: &Socket) -> Result<(), Error> {
    use std::ffi::CString;

    let cstr = CString::new(interface).map_err(|_| {
        Error::SocketOptionFailed(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "interface name contains a NUL byte",
        ))
    })?;

    // SAFETY: `cstr` stays alive for the duration of the call and `fd` is a
    // valid, open socket owned by `socket`.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BINDTODEVICE,
            cstr.as_ptr() as *const libc::c_void,
            cstr.as_bytes_with_nul().len() as libc::socklen_t,
        )
    };

    if ret != 0 {
        return Err(Error::SocketOptionFailed(std::io::Error::last_os_error()));
    }

    Ok(())
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
pub(crate) fn bind_to_device(interface: &str, network: &str, socket: &Socket) -> Result<(), Error> {
    let index = iface::global()
        .by_name(interface)
        .map_err(|_| Error::InterfaceNotFound(interface.to_owned()))?
        .index;

    let (level, optname) = match network {
        "tcp4" | "udp4" => (libc::IPPROTO_IP, libc::IP_BOUND_IF),
        "tcp6" | "udp6" => (libc::IPPROTO_IPV6, libc::IPV6_BOUND_IF),
        _ => return Ok(()),
    };

    let value = index as libc::c_int;

    // SAFETY: `value` outlives the call and `fd` is a valid, open socket.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            optname,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        return Err(Error::SocketOptionFailed(std::io::Error::last_os_error()));
    }

    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios")))]
pub(crate) fn bind_to_device(
    _interface: &str,
    _network: &str,
    _socket: &Socket,
) -> Result<(), Error> {
    Err(Error::PlatformUnsupported)
}
