//! The handshake state machine and message splice. Structured as one
//! non-blocking poll loop per connection: set both sockets non-blocking,
//! poll each in turn, back off on `WouldBlock`, ignore write errors the
//! way `let _ = stream.write_all(...)` does throughout this module.
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::thread;
use std::time::Duration;

use crate::cipher::{Cipher, XChaChaKeystreamCipher, KEY_BLOCK_LEN};
use crate::buffer::PacketBuffer;
use crate::dispatcher::{Dispatcher, HandleOutcome, PendingSynth, SynthTarget};

const POLL_BACKOFF: Duration = Duration::from_millis(10);
const READ_CHUNK: usize = 4096;
/// `1u32` LE — the server's opening control datagram.
const SERVER_MAGIC: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// ConnectionState `-1`.
    AwaitingServerMagic,
    /// ConnectionState `0`/`1` collapsed: the four key blocks may arrive in
    /// either order across the two sockets, so each slot is tracked
    /// independently and the phase advances to `SteadyState` the moment all
    /// four are filled, rather than replaying the source's two-sided
    /// integer counter. See DESIGN.md.
    AwaitingKeys,
    /// ConnectionState `2`.
    SteadyState,
}

#[derive(Default)]
struct KeySlots {
    client: [Option<[u8; KEY_BLOCK_LEN]>; 2],
    server: [Option<[u8; KEY_BLOCK_LEN]>; 2],
}

impl KeySlots {
    fn all_filled(&self) -> bool {
        self.client.iter().all(Option::is_some) && self.server.iter().all(Option::is_some)
    }
}

/// Owns both sockets, both cipher sessions, both reassembly buffers, and the
/// one `Dispatcher` for this client.
pub struct Connection {
    client_stream: TcpStream,
    server_stream: TcpStream,
    /// client ↔ proxy.
    session1: XChaChaKeystreamCipher,
    /// proxy ↔ server.
    session2: XChaChaKeystreamCipher,
    client_buffer: PacketBuffer,
    server_buffer: PacketBuffer,
    dispatcher: Dispatcher,
    phase: Phase,
    keys: KeySlots,
    client_hs: Vec<u8>,
    server_hs: Vec<u8>,
}

impl Connection {
    pub fn new(client_stream: TcpStream, server_stream: TcpStream, dispatcher: Dispatcher) -> Self {
        Connection {
            client_stream,
            server_stream,
            session1: XChaChaKeystreamCipher::new(),
            session2: XChaChaKeystreamCipher::new(),
            client_buffer: PacketBuffer::new(),
            server_buffer: PacketBuffer::new(),
            dispatcher,
            phase: Phase::AwaitingServerMagic,
            keys: KeySlots::default(),
            client_hs: Vec::new(),
            server_hs: Vec::new(),
        }
    }

    /// Blocks the calling thread for the lifetime of the connection. Callers
    /// spawn this on its own thread, one per connection.
    pub fn run(mut self) {
        self.client_stream.set_nonblocking(true).ok();
        self.server_stream.set_nonblocking(true).ok();
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match poll_read(&mut self.server_stream, &mut buf) {
                ReadOutcome::Data(bytes) => {
                    if !self.on_server_bytes(bytes) {
                        break;
                    }
                }
                ReadOutcome::Closed => break,
                ReadOutcome::WouldBlock => {}
            }
            match poll_read(&mut self.client_stream, &mut buf) {
                ReadOutcome::Data(bytes) => {
                    if !self.on_client_bytes(bytes) {
                        break;
                    }
                }
                ReadOutcome::Closed => break,
                ReadOutcome::WouldBlock => {}
            }
            thread::sleep(POLL_BACKOFF);
        }
        let _ = self.client_stream.shutdown(Shutdown::Both);
        let _ = self.server_stream.shutdown(Shutdown::Both);
        self.dispatcher.reset();
    }

    fn on_server_bytes(&mut self, bytes: Vec<u8>) -> bool {
        match self.phase {
            Phase::SteadyState => {
                let mut bytes = bytes;
                self.session2.decrypt(&mut bytes);
                self.server_buffer.write(&bytes);
                self.drain_server()
            }
            _ => {
                self.server_hs.extend_from_slice(&bytes);
                self.drive_server_handshake()
            }
        }
    }

    fn on_client_bytes(&mut self, bytes: Vec<u8>) -> bool {
        match self.phase {
            Phase::SteadyState => {
                let mut bytes = bytes;
                self.session1.decrypt(&mut bytes);
                self.client_buffer.write(&bytes);
                self.drain_client()
            }
            _ => {
                self.client_hs.extend_from_slice(&bytes);
                self.drive_client_handshake()
            }
        }
    }

    fn drive_server_handshake(&mut self) -> bool {
        loop {
            match self.phase {
                Phase::AwaitingServerMagic => {
                    if self.server_hs.len() < 4 {
                        return true;
                    }
                    let magic_bytes: Vec<u8> = self.server_hs.drain(..4).collect();
                    let magic = u32::from_le_bytes(magic_bytes[..4].try_into().unwrap());
                    if magic != SERVER_MAGIC {
                        println!("[CONN] fatal: server magic was {magic}, expected {SERVER_MAGIC}");
                        return false;
                    }
                    let _ = self.client_stream.write_all(&magic_bytes);
                    self.phase = Phase::AwaitingKeys;
                }
                Phase::AwaitingKeys => {
                    if self.server_hs.len() < KEY_BLOCK_LEN {
                        return true;
                    }
                    let block = take_block(&mut self.server_hs);
                    if self.keys.server[0].is_none() {
                        self.keys.server[0] = Some(block);
                        self.session1.set_server_key(0, block);
                        self.session2.set_server_key(0, block);
                    } else {
                        self.keys.server[1] = Some(block);
                        self.session1.set_server_key(1, block);
                        self.session2.set_server_key(1, block);
                    }
                    let _ = self.client_stream.write_all(&block);
                    if !self.maybe_finish_handshake() {
                        return false;
                    }
                }
                Phase::SteadyState => return true,
            }
        }
    }

    fn drive_client_handshake(&mut self) -> bool {
        loop {
            if self.phase != Phase::AwaitingKeys {
                // Client data that arrives before the server's opening magic
                // just waits in `client_hs`.
                return true;
            }
            if self.client_hs.len() < KEY_BLOCK_LEN {
                return true;
            }
            let block = take_block(&mut self.client_hs);
            if self.keys.client[0].is_none() {
                self.keys.client[0] = Some(block);
                self.session1.set_client_key(0, block);
                self.session2.set_client_key(0, block);
            } else {
                self.keys.client[1] = Some(block);
                self.session1.set_client_key(1, block);
                self.session2.set_client_key(1, block);
            }
            let _ = self.server_stream.write_all(&block);
            if !self.maybe_finish_handshake() {
                return false;
            }
        }
    }

    fn maybe_finish_handshake(&mut self) -> bool {
        if self.phase != Phase::AwaitingKeys || !self.keys.all_filled() {
            return true;
        }
        // All four 128-byte blocks are present by construction of the
        // branches above; a failure here is a programmer error, not a
        // recoverable runtime condition.
        self.session1.init().expect("all four key-exchange blocks were set");
        self.session2.init().expect("all four key-exchange blocks were set");
        self.phase = Phase::SteadyState;
        println!("[CONN] handshake complete, entering steady state");
        true
    }

    fn drain_client(&mut self) -> bool {
        loop {
            let msg = match self.client_buffer.read() {
                Ok(Some(msg)) => msg,
                Ok(None) => return true,
                Err(e) => {
                    println!("[CONN] fatal framing error from client: {e}");
                    return false;
                }
            };
            match self.dispatcher.handle(msg, false, false) {
                HandleOutcome::Forward(out) => {
                    let mut bytes = out.into_bytes();
                    self.session2.encrypt(&mut bytes);
                    let _ = self.server_stream.write_all(&bytes);
                }
                HandleOutcome::Silenced => {}
            }
            self.flush_pending_synth();
        }
    }

    fn drain_server(&mut self) -> bool {
        loop {
            let msg = match self.server_buffer.read() {
                Ok(Some(msg)) => msg,
                Ok(None) => return true,
                Err(e) => {
                    println!("[CONN] fatal framing error from server: {e}");
                    return false;
                }
            };
            match self.dispatcher.handle(msg, true, false) {
                HandleOutcome::Forward(out) => {
                    let mut bytes = out.into_bytes();
                    self.session1.encrypt(&mut bytes);
                    let _ = self.client_stream.write_all(&bytes);
                }
                HandleOutcome::Silenced => {}
            }
            self.flush_pending_synth();
        }
    }

    /// Synthetic messages are only ever processed once the triggering
    /// `handle` call has returned; draining here, after `handle` but before
    /// the next socket read, keeps that ordering while still letting a
    /// synthesized message's own hooks synthesize further messages.
    fn flush_pending_synth(&mut self) {
        loop {
            let batch = self.dispatcher.take_pending_synth();
            if batch.is_empty() {
                return;
            }
            for entry in batch {
                match entry {
                    PendingSynth::Verbatim { target, bytes } => self.send_to(target, bytes),
                    PendingSynth::ForHandle { target, message } => {
                        let incoming = matches!(target, SynthTarget::ToClient);
                        match self.dispatcher.handle(message, incoming, true) {
                            HandleOutcome::Forward(out) => self.send_to(target, out.into_bytes()),
                            HandleOutcome::Silenced => {}
                        }
                    }
                }
            }
        }
    }

    fn send_to(&mut self, target: SynthTarget, mut bytes: Vec<u8>) {
        match target {
            SynthTarget::ToClient => {
                self.session1.encrypt(&mut bytes);
                let _ = self.client_stream.write_all(&bytes);
            }
            SynthTarget::ToServer => {
                self.session2.encrypt(&mut bytes);
                let _ = self.server_stream.write_all(&bytes);
            }
        }
    }
}

fn take_block(buf: &mut Vec<u8>) -> [u8; KEY_BLOCK_LEN] {
    let bytes: Vec<u8> = buf.drain(..KEY_BLOCK_LEN).collect();
    let mut block = [0u8; KEY_BLOCK_LEN];
    block.copy_from_slice(&bytes);
    block
}

enum ReadOutcome {
    Data(Vec<u8>),
    WouldBlock,
    Closed,
}

fn poll_read(stream: &mut TcpStream, buf: &mut [u8]) -> ReadOutcome {
    match stream.read(buf) {
        Ok(0) => ReadOutcome::Closed,
        Ok(n) => ReadOutcome::Data(buf[..n].to_vec()),
        Err(e) if e.kind() == ErrorKind::WouldBlock => ReadOutcome::WouldBlock,
        Err(_) => ReadOutcome::Closed,
    }
}
