//! Host network access used by the TCP check

use std::ffi::CStr;
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpSocket;
use tracing::debug;

use crate::error::CheckError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

#[async_trait]
pub trait Network: Send + Sync {
    fn link_state(&self, interface: &str) -> Result<LinkState, CheckError>;

    fn interface_address(&self, interface: &str) -> Result<IpAddr, CheckError>;

    async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr, CheckError>;

    /// Time to complete a TCP handshake from `local` to `remote`.
    async fn connect_latency(&self, local: IpAddr, remote: SocketAddr) -> io::Result<Duration>;
}

/// Linux implementation backed by sysfs, `getifaddrs` and real sockets.
#[derive(Debug, Clone)]
pub struct SystemNetwork {
    sysfs_net: PathBuf,
}

impl Default for SystemNetwork {
    fn default() -> Self {
        Self {
            sysfs_net: PathBuf::from("/sys/class/net"),
        }
    }
}

impl SystemNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sysfs_root(root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_net: root.into(),
        }
    }
}

#[async_trait]
impl Network for SystemNetwork {
    fn link_state(&self, interface: &str) -> Result<LinkState, CheckError> {
        let dir = self.sysfs_net.join(interface);
        if !dir.is_dir() {
            return Err(CheckError::InterfaceMissing {
                interface: interface.to_owned(),
            });
        }

        let state = fs::read_to_string(dir.join("operstate")).map_err(|err| {
            CheckError::InterfaceState {
                interface: interface.to_owned(),
                reason: err.to_string(),
            }
        })?;
        if state.trim_start().starts_with("up") {
            Ok(LinkState::Up)
        } else {
            Ok(LinkState::Down)
        }
    }

    fn interface_address(&self, interface: &str) -> Result<IpAddr, CheckError> {
        let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
        // SAFETY: on success getifaddrs hands us a list we release below.
        if unsafe { libc::getifaddrs(&mut head) } != 0 {
            return Err(io::Error::last_os_error().into());
        }

        let mut found = None;
        let mut cursor = head;
        while !cursor.is_null() {
            // SAFETY: cursor is a live node of the list returned above.
            let entry = unsafe { &*cursor };
            cursor = entry.ifa_next;

            if entry.ifa_addr.is_null() || entry.ifa_name.is_null() {
                continue;
            }
            // SAFETY: ifa_name is a NUL-terminated string owned by the list.
            let name = unsafe { CStr::from_ptr(entry.ifa_name) };
            if name.to_bytes() != interface.as_bytes() {
                continue;
            }
            // SAFETY: ifa_addr is non-null and sa_family identifies its layout.
            let family = i32::from(unsafe { (*entry.ifa_addr).sa_family });
            if family == libc::AF_INET {
                // SAFETY: AF_INET addresses are sockaddr_in.
                let sin = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in) };
                found = Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))));
                break;
            }
        }
        // SAFETY: head came from getifaddrs and is freed exactly once.
        unsafe { libc::freeifaddrs(head) };

        found.ok_or_else(|| CheckError::NoAddress {
            interface: interface.to_owned(),
        })
    }

    async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr, CheckError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        let mut addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|err| CheckError::Resolve {
                host: host.to_owned(),
                reason: err.to_string(),
            })?;
        let addr = addrs
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| CheckError::Resolve {
                host: host.to_owned(),
                reason: "no IPv4 address".to_owned(),
            })?;
        debug!(host, %addr, "resolved ping target");
        Ok(addr)
    }

    async fn connect_latency(&self, local: IpAddr, remote: SocketAddr) -> io::Result<Duration> {
        let socket = match remote {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.bind(SocketAddr::new(local, 0))?;

        let started = Instant::now();
        let stream = socket.connect(remote).await?;
        let latency = started.elapsed();
        drop(stream);
        Ok(latency)
    }
}
