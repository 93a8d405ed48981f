use std::io;
use std::net::Ipv4Addr;

use netsight_core::config::VpnConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunError {
    #[error("TUN device creation failed: {0}")]
    CreateFailed(String),
    #[error("TUN device not supported on this platform")]
    NotSupported,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration for creating a TUN device.
#[derive(Debug, Clone)]
pub struct TunConfig {
    /// Name of the TUN device (e.g., "nsight0").
    pub name: String,
    /// Tunnel address assigned to the device.
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub mtu: u16,
}

impl TunConfig {
    pub fn from_vpn(vpn: &VpnConfig) -> Self {
        let network = vpn.network();
        Self {
            name: vpn.device_name.clone(),
            address: network.addr(),
            prefix_len: network.prefix_len(),
            mtu: vpn.mtu,
        }
    }
}

/// Handle to the capture interface.
pub struct TunDevice {
    config: TunConfig,
    #[cfg(target_os = "linux")]
    fd: std::os::unix::io::RawFd,
}

impl TunDevice {
    /// Open `/dev/net/tun`, attach the interface and bring it up with the
    /// tunnel address.
    #[cfg(target_os = "linux")]
    pub fn create(config: TunConfig) -> Result<Self, TunError> {
        // linux/if_tun.h
        const IFF_TUN: u16 = 0x0001;
        const IFF_NO_PI: u16 = 0x1000;
        const TUNSETIFF: libc::c_ulong = 0x400454CA;
        const IFNAMSIZ: usize = 16;

        tracing::info!(name = %config.name, address = %config.address, "opening tun device");

        let fd = unsafe { libc::open(c"/dev/net/tun".as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            return Err(TunError::CreateFailed(format!("/dev/net/tun: {err}")));
        }

        // ifreq: interface name then the flags union member
        let mut request = [0u8; 40];
        let name = config.name.as_bytes();
        let name_len = name.len().min(IFNAMSIZ - 1);
        request[..name_len].copy_from_slice(&name[..name_len]);
        request[IFNAMSIZ..IFNAMSIZ + 2].copy_from_slice(&(IFF_TUN | IFF_NO_PI).to_ne_bytes());

        if unsafe { libc::ioctl(fd, TUNSETIFF, request.as_ptr()) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(TunError::CreateFailed(format!("attach {}: {err}", config.name)));
        }

        let device = Self { config, fd };
        device.configure_link();
        Ok(device)
    }

    /// Assign the tunnel address and raise the link. Failures are logged;
    /// an interface configured externally keeps working.
    #[cfg(target_os = "linux")]
    fn configure_link(&self) {
        let cidr = format!("{}/{}", self.config.address, self.config.prefix_len);
        let mtu = self.config.mtu.to_string();
        let steps: [&[&str]; 2] = [
            &["addr", "add", &cidr, "dev", &self.config.name],
            &["link", "set", &self.config.name, "up", "mtu", &mtu],
        ];
        for args in steps {
            match std::process::Command::new("ip").args(args).status() {
                Ok(status) if status.success() => {}
                Ok(status) => {
                    tracing::warn!(name = %self.config.name, ?args, %status, "ip command failed");
                }
                Err(e) => {
                    tracing::warn!(name = %self.config.name, error = %e, "failed to run ip");
                    return;
                }
            }
        }
        tracing::info!(name = %self.config.name, fd = self.fd, mtu = self.config.mtu, "tun device up");
    }

    #[cfg(not(target_os = "linux"))]
    pub fn create(_config: TunConfig) -> Result<Self, TunError> {
        Err(TunError::NotSupported)
    }

    pub fn config(&self) -> &TunConfig {
        &self.config
    }

    #[cfg(target_os = "linux")]
    pub fn raw_fd(&self) -> std::os::unix::io::RawFd {
        self.fd
    }

    #[cfg(not(target_os = "linux"))]
    pub fn raw_fd(&self) -> std::os::unix::io::RawFd {
        -1
    }

    /// Read one frame. Blocks until a frame is available.
    #[cfg(target_os = "linux")]
    pub fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        syscall_len(unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) })
    }

    /// Write one complete frame.
    #[cfg(target_os = "linux")]
    pub fn write_packet(&self, frame: &[u8]) -> io::Result<usize> {
        syscall_len(unsafe { libc::write(self.fd, frame.as_ptr().cast(), frame.len()) })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn read_packet(&self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::Unsupported.into())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn write_packet(&self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::ErrorKind::Unsupported.into())
    }
}

#[cfg(target_os = "linux")]
fn syscall_len(n: isize) -> io::Result<usize> {
    usize::try_from(n).map_err(|_| io::Error::last_os_error())
}

#[cfg(target_os = "linux")]
impl Drop for TunDevice {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
        tracing::debug!(name = %self.config.name, "tun device closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_vpn_section() {
        let mut vpn = netsight_core::config::Config::default_config().vpn;
        vpn.device_name = "nstest0".to_string();
        vpn.address = "10.9.0.1".to_string();
        vpn.prefix_len = 16;

        let config = TunConfig::from_vpn(&vpn);
        assert_eq!(config.name, "nstest0");
        assert_eq!(config.address, Ipv4Addr::new(10, 9, 0, 1));
        assert_eq!(config.prefix_len, 16);
        assert_eq!(config.mtu, 1500);
    }
}
