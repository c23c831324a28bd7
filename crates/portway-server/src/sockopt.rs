//! Original-destination recovery for transparent-proxy listeners.

use portway_core::{Destination, Network};
use serde::Deserialize;
use std::io;
use tokio::net::TcpStream;

/// How a listener learns the pre-NAT destination of a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TproxyMode {
    #[default]
    Off,
    /// NAT redirect: ask the kernel with `SO_ORIGINAL_DST`.
    Redirect,
    /// TPROXY: the socket's local address already is the destination.
    Tproxy,
}

/// Best-effort recovery of the destination a client originally dialed.
/// `Ok(None)` when `mode` is off.
pub fn recover_original_destination(mode: TproxyMode, stream: &TcpStream) -> io::Result<Option<Destination>> {
    let addr = match mode {
        TproxyMode::Off => return Ok(None),
        TproxyMode::Tproxy => stream.local_addr()?,
        TproxyMode::Redirect => original_dst(stream)?,
    };
    Ok(Some(Destination::from_socket_addr(Network::Tcp, addr)))
}

#[cfg(target_os = "linux")]
fn original_dst(stream: &TcpStream) -> io::Result<std::net::SocketAddr> {
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
    use std::os::fd::AsRawFd;

    // Same option number as SO_ORIGINAL_DST, at the IPv6 level.
    const IP6T_SO_ORIGINAL_DST: libc::c_int = 80;

    let fd = stream.as_raw_fd();
    if stream.local_addr()?.is_ipv6() {
        // SAFETY: fd is a live socket owned by `stream`; addr and len
        // describe a writable sockaddr_in6.
        unsafe {
            let mut addr: libc::sockaddr_in6 = std::mem::zeroed();
            let mut len = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
            let ret = libc::getsockopt(
                fd,
                libc::SOL_IPV6,
                IP6T_SO_ORIGINAL_DST,
                &mut addr as *mut _ as *mut libc::c_void,
                &mut len,
            );
            if ret != 0 {
                return Err(io::Error::last_os_error());
            }
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let ip = match ip.to_ipv4_mapped() {
                Some(v4) => std::net::IpAddr::V4(v4),
                None => std::net::IpAddr::V6(ip),
            };
            return Ok(SocketAddr::new(ip, u16::from_be(addr.sin6_port)));
        }
    }

    // SAFETY: as above, for a sockaddr_in.
    unsafe {
        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let ret = libc::getsockopt(
            fd,
            libc::SOL_IP,
            libc::SO_ORIGINAL_DST,
            &mut addr as *mut _ as *mut libc::c_void,
            &mut len,
        );
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
        Ok(SocketAddr::new(ip.into(), u16::from_be(addr.sin_port)))
    }
}

#[cfg(not(target_os = "linux"))]
fn original_dst(_stream: &TcpStream) -> io::Result<std::net::SocketAddr> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "redirect mode is only available on linux",
    ))
}
