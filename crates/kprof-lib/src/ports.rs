//! Ephemeral local port allocation

use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener};

/// Ask the OS for a free TCP port on `address`
///
/// The probe socket is closed before returning, so the port is only
/// likely, not guaranteed, to still be free when the caller binds it.
pub fn free_port(address: IpAddr) -> io::Result<u16> {
    let listener = TcpListener::bind(SocketAddr::new(address, 0))?;
    Ok(listener.local_addr()?.port())
}
