use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

use hookrelay::{ConnectOptions, JsonProtocolCodec, ListenOptions};

/// `hookrelay <bind_addr> <server_addr> [table_path]` — a minimal CLI
/// wiring `config` into `server::create_server`, no modules loaded by
/// default. Module loading is left to embedding code via `on_dispatch`.
fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let bind_addr: SocketAddr = args
        .next()
        .context("usage: hookrelay <bind_addr> <server_addr> [table_path]")?
        .parse()
        .context("parsing bind_addr")?;
    let server_addr: SocketAddr = args.next().context("missing server_addr")?.parse().context("parsing server_addr")?;
    let table_path = args.next();

    let codec: Arc<dyn hookrelay::ProtocolCodec> = match table_path {
        Some(path) => Arc::new(JsonProtocolCodec::load(&path).with_context(|| format!("loading {path}"))?),
        None => {
            println!("[MAIN] no table path given, running with an empty codec (every name is unresolved)");
            Arc::new(JsonProtocolCodec::from_tables(Default::default(), Default::default()))
        }
    };

    let listen = ListenOptions { bind_addr, connect_opts: ConnectOptions::new(server_addr) };
    let handle = hookrelay::create_server(listen, codec, Arc::new(|_dispatcher| {}))?;
    println!("[MAIN] listening on {} -> {}", handle.local_addr, server_addr);

    loop {
        thread::sleep(Duration::from_secs(5));
        println!("[MAIN] active connections: {}", handle.registry.count());
    }
}
