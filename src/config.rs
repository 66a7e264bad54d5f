//! Environment/argv-derived configuration.
//!
//! Functions take configuration as plain arguments (`connect(server_ip,
//! port, psk, ...)`, `start_server(state, bind_ip, port, ...)`) rather than
//! through a config-file crate; this module keeps that convention and adds
//! the one real environment switch.
use std::net::SocketAddr;

/// Disables the "implied latest version" warning emitted by
/// `Dispatcher::create_hook`.
pub const NO_WARN_IMPLIED_VERSION_VAR: &str = "NO_WARN_IMPLIED_VERSION";

pub fn warn_on_implied_version() -> bool {
    std::env::var(NO_WARN_IMPLIED_VERSION_VAR).is_err()
}

/// Where to listen for game clients, and where to dial the real server.
#[derive(Debug, Clone)]
pub struct ListenOptions {
    pub bind_addr: SocketAddr,
    pub connect_opts: ConnectOptions,
}

/// Where the proxy dials the real game server, plus the opcode that
/// signals the client's protocol-version check — treated as a versioned
/// constant and made configurable.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub server_addr: SocketAddr,
    pub check_version_opcode: u16,
}

impl ConnectOptions {
    pub const DEFAULT_CHECK_VERSION_OPCODE: u16 = 19900;

    pub fn new(server_addr: SocketAddr) -> Self {
        ConnectOptions {
            server_addr,
            check_version_opcode: Self::DEFAULT_CHECK_VERSION_OPCODE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_check_version_opcode_is_19900() {
        let opts = ConnectOptions::new("127.0.0.1:1".parse().unwrap());
        assert_eq!(opts.check_version_opcode, 19900);
    }
}
