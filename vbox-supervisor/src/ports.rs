//! Loopback port allocation for port forwarding and remote desktop.
//!
//! The port is discovered by binding a loopback socket and reading back the
//! assigned port; the socket is closed before the hypervisor binds it. The
//! short race window in between is accepted — no higher-level reservation
//! exists, and retries live at the job level.

use std::net::TcpListener;

use vbox_core::error::{Result, VboxError};

use crate::VboxVm;

fn bind_loopback(port: u16) -> std::io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", port))?;
    Ok(listener.local_addr()?.port())
}

impl VboxVm {
    /// Allocate the host side of the NAT port-forwarding rule.
    ///
    /// The configured host port is tried first; on bind failure any
    /// ephemeral port is taken instead.
    pub fn get_port_forwarding_port(&mut self) -> Result<u16> {
        let port = match bind_loopback(self.pf_host_port) {
            Ok(port) => port,
            Err(_) => bind_loopback(0)
                .map_err(|err| VboxError::Bind(err.to_string()))?,
        };
        self.pf_host_port = port;
        Ok(port)
    }

    /// Allocate the host port advertised for remote desktop.
    pub fn get_remote_desktop_port(&mut self) -> Result<u16> {
        let port = bind_loopback(0).map_err(|err| VboxError::Bind(err.to_string()))?;
        self.rd_host_port = port;
        Ok(port)
    }
}
