//! Ephemeral port allocation.
//!
//! Ports are probed by binding a throwaway listener on port 0, reading
//! back the kernel-assigned port, and closing the listener. The port is
//! then handed to a router process that binds it some time later. The
//! window between release and re-bind is a known reuse race: another
//! process could grab the port in between. Holding the probe socket
//! open until launch is not an option, the router process must bind
//! the port itself.

use std::io;
use std::net::TcpListener;

/// Probe the kernel for a currently-free TCP port and release it.
pub fn allocate_port() -> io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}
