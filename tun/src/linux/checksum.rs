//! RX checksum offload, queried and toggled through `SIOCETHTOOL` the way
//! `ethtool -K <iface> rx off` would.

use crate::ioctl;
use std::os::fd::RawFd;

const ETHTOOL_GRXCSUM: u32 = 0x0000_0014;
const ETHTOOL_SRXCSUM: u32 = 0x0000_0015;
const SIOCETHTOOL: libc::c_ulong = 0x8946;

#[repr(C)]
struct EthtoolValue {
    cmd: u32,
    data: u32,
}

pub fn rx_checksum_offload_enabled(ctl_fd: RawFd, name: &str) -> std::io::Result<bool> {
    let mut value = EthtoolValue {
        cmd: ETHTOOL_GRXCSUM,
        data: 0,
    };

    let mut req = ioctl::Request::new_ethtool(name, &mut value as *mut _ as *mut std::ffi::c_void);

    // SAFETY: `ctl_fd` is open and `req` points at a live `EthtoolValue`.
    unsafe { ioctl::exec(ctl_fd, SIOCETHTOOL, &mut req)? };

    Ok(value.data != 0)
}

pub fn disable_rx_checksum_offload(ctl_fd: RawFd, name: &str) -> std::io::Result<()> {
    let mut value = EthtoolValue {
        cmd: ETHTOOL_SRXCSUM,
        data: 0,
    };

    let mut req = ioctl::Request::new_ethtool(name, &mut value as *mut _ as *mut std::ffi::c_void);

    // SAFETY: `ctl_fd` is open and `req` points at a live `EthtoolValue`.
    unsafe { ioctl::exec(ctl_fd, SIOCETHTOOL, &mut req) }
}
