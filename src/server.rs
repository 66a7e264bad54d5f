//! The `createServer` factory: a non-blocking listener, `WouldBlock`
//! back-off, one spawned thread per accepted client.
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dashmap::DashMap;
use rand::{distributions::Alphanumeric, Rng};
use std::net::{SocketAddr, TcpListener};

use crate::codec::ProtocolCodec;
use crate::config::ListenOptions;
use crate::connection::Connection;
use crate::dispatcher::Dispatcher;

/// A callback invoked once per accepted connection, immediately after its
/// `Dispatcher` is constructed and before the connection starts running, so
/// the caller can load modules on it.
pub type OnDispatch = Arc<dyn Fn(&Dispatcher) + Send + Sync>;

/// Diagnostics-only view of currently active connections; never consulted
/// by the core dispatch path, which shares no resources across connections.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    active: Arc<DashMap<SocketAddr, Instant>>,
}

impl ConnectionRegistry {
    pub fn count(&self) -> usize {
        self.active.len()
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.active.iter().map(|e| *e.key()).collect()
    }
}

pub struct ServerHandle {
    pub registry: ConnectionRegistry,
    pub local_addr: SocketAddr,
}

/// Binds `listen.bind_addr`, then for each accepted client: dials
/// `listen.connect_opts.server_addr`, constructs a `Dispatcher`, invokes
/// `on_dispatch`, and spawns the connection's drive loop. Returns
/// immediately; the accept loop runs on its own thread.
pub fn create_server(listen: ListenOptions, codec: Arc<dyn ProtocolCodec>, on_dispatch: OnDispatch) -> Result<ServerHandle> {
    let listener = TcpListener::bind(listen.bind_addr).with_context(|| format!("binding {}", listen.bind_addr))?;
    listener.set_nonblocking(true).ok();
    let local_addr = listener.local_addr().with_context(|| "reading bound local address")?;
    let registry = ConnectionRegistry::default();

    let accept_registry = registry.clone();
    let connect_opts = listen.connect_opts.clone();
    thread::spawn(move || accept_loop(listener, connect_opts, codec, on_dispatch, accept_registry));

    Ok(ServerHandle { registry, local_addr })
}

/// A short per-connection correlation token for log lines.
fn diagnostic_id() -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(8).map(char::from).collect()
}

fn accept_loop(
    listener: TcpListener,
    connect_opts: crate::config::ConnectOptions,
    codec: Arc<dyn ProtocolCodec>,
    on_dispatch: OnDispatch,
    registry: ConnectionRegistry,
) {
    loop {
        match listener.accept() {
            Ok((client_stream, addr)) => {
                let server_stream = match TcpStream::connect(connect_opts.server_addr) {
                    Ok(s) => s,
                    Err(e) => {
                        println!("[SERVER] could not dial upstream {}: {e}", connect_opts.server_addr);
                        continue;
                    }
                };
                let dispatcher = Dispatcher::new(codec.clone(), connect_opts.check_version_opcode);
                on_dispatch(&dispatcher);

                let diag_id = diagnostic_id();
                println!("[SERVER] accepted {addr} (id {diag_id}), dialing {}", connect_opts.server_addr);
                registry.active.insert(addr, Instant::now());
                let cleanup_registry = registry.clone();
                let connection = Connection::new(client_stream, server_stream, dispatcher);
                thread::spawn(move || {
                    connection.run();
                    cleanup_registry.active.remove(&addr);
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => thread::sleep(Duration::from_millis(50)),
            Err(e) => {
                println!("[SERVER] accept error: {e}");
                thread::sleep(Duration::from_millis(200));
            }
        }
    }
}
