//! Reassemble a TCP byte stream into discrete length-prefixed messages.
//! Generalizes a length-prefixed framing convention to an arbitrary,
//! growable byte stream.
use std::collections::VecDeque;

use crate::error::ProxyError;
use crate::message::{Message, MAX_MESSAGE_LEN};

/// Never fragments or coalesces messages; preserves byte order.
#[derive(Debug, Default)]
pub struct PacketBuffer {
    pending: VecDeque<u8>,
}

impl PacketBuffer {
    pub fn new() -> Self {
        PacketBuffer { pending: VecDeque::new() }
    }

    /// Append freshly received bytes.
    pub fn write(&mut self, bytes: &[u8]) {
        self.pending.extend(bytes.iter().copied());
    }

    /// Detach and return exactly one complete message, if buffered.
    ///
    /// A length prefix outside `[4, MAX_MESSAGE_LEN]` is a fatal framing
    /// error for the owning connection.
    pub fn read(&mut self) -> Result<Option<Message>, ProxyError> {
        if self.pending.len() < 2 {
            return Ok(None);
        }
        let declared = u16::from_le_bytes([self.pending[0], self.pending[1]]) as usize;
        if declared < 4 || declared > MAX_MESSAGE_LEN {
            return Err(ProxyError::Framing(format!(
                "invalid length prefix {declared}"
            )));
        }
        if self.pending.len() < declared {
            return Ok(None);
        }
        let frame: Vec<u8> = self.pending.drain(..declared).collect();
        Ok(Some(Message::from_trusted(frame)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn framed(opcode: u16, payload: &[u8]) -> Vec<u8> {
        let len = 4 + payload.len();
        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(&(len as u16).to_le_bytes());
        out.extend_from_slice(&opcode.to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn yields_none_until_complete() {
        let mut pb = PacketBuffer::new();
        let msg = framed(0x1234, &[0xaa, 0xbb]);
        pb.write(&msg[..3]);
        assert!(pb.read().unwrap().is_none());
        pb.write(&msg[3..]);
        let out = pb.read().unwrap().unwrap();
        assert_eq!(out.as_bytes(), &msg[..]);
    }

    #[test]
    fn survives_arbitrary_chunking() {
        // Property: for any chunking of a concatenation of well-formed
        // messages, PacketBuffer yields exactly that message sequence.
        let messages: Vec<Vec<u8>> = vec![
            framed(1, &[]),
            framed(2, &[9, 9, 9]),
            framed(0xffff, &[1; 100]),
        ];
        let mut concatenated = Vec::new();
        for m in &messages {
            concatenated.extend_from_slice(m);
        }
        for chunk_size in [1usize, 2, 3, 7, 13, concatenated.len()] {
            let mut pb = PacketBuffer::new();
            let mut out = Vec::new();
            for chunk in concatenated.chunks(chunk_size.max(1)) {
                pb.write(chunk);
                while let Some(m) = pb.read().unwrap() {
                    out.push(m.into_bytes());
                }
            }
            assert_eq!(out, messages, "chunk_size={chunk_size}");
        }
    }

    #[test]
    fn oversized_length_is_fatal() {
        let mut pb = PacketBuffer::new();
        pb.write(&[0xff, 0xff]);
        assert!(pb.read().is_err());
    }

    #[test]
    fn undersized_length_is_fatal() {
        let mut pb = PacketBuffer::new();
        pb.write(&[2, 0]);
        assert!(pb.read().is_err());
    }
}
