//! Wire message framing and naming.
use crate::error::ProxyError;

/// `[u16 LE length][u16 LE opcode][payload]`, `len >= 4`, `len == buffer.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message(Vec<u8>);

/// Implementation ceiling for a single message; a declared length beyond this
/// is a fatal framing error, not a real payload.
pub const MAX_MESSAGE_LEN: usize = 64 * 1024;

impl Message {
    /// Validate and wrap a complete framed buffer.
    pub fn from_bytes(buf: Vec<u8>) -> Result<Self, ProxyError> {
        if buf.len() < 4 {
            return Err(ProxyError::Framing(format!(
                "message too short: {} bytes",
                buf.len()
            )));
        }
        let declared = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        if declared < 4 || declared > MAX_MESSAGE_LEN {
            return Err(ProxyError::Framing(format!(
                "invalid length prefix {declared}"
            )));
        }
        if declared != buf.len() {
            return Err(ProxyError::Framing(format!(
                "length prefix {declared} does not match buffer size {}",
                buf.len()
            )));
        }
        Ok(Message(buf))
    }

    /// Wrap bytes already known to be framed correctly (used when
    /// re-serializing via the codec, where `write` is trusted to produce a
    /// valid frame).
    pub fn from_trusted(buf: Vec<u8>) -> Self {
        debug_assert!(buf.len() >= 4);
        Message(buf)
    }

    pub fn opcode(&self) -> u16 {
        u16::from_le_bytes([self.0[2], self.0[3]])
    }

    pub fn payload(&self) -> &[u8] {
        &self.0[4..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    #[allow(clippy::len_without_is_empty)] // a valid Message is never empty
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// Either a concrete opcode or one of the two registry sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookCode {
    /// `*` — matches every opcode during registration/merge.
    Any,
    /// A concrete, codec-resolved opcode.
    Code(u16),
    /// `_UNKNOWN` — name did not resolve against the codec's tables.
    Unknown,
}

impl std::fmt::Display for HookCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookCode::Any => write!(f, "*"),
            HookCode::Code(c) => write!(f, "{c}"),
            HookCode::Unknown => write!(f, "_UNKNOWN"),
        }
    }
}

/// A canonical, uppercase-with-underscores message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageName(String);

impl MessageName {
    /// `*` forces `code = Any` and is otherwise opaque — not name-resolved.
    pub const WILDCARD: &'static str = "*";

    /// Normalize an input name:
    /// - the literal `sF2pPremiumUserPermission` is a special case.
    /// - otherwise, if the name has no underscore, each uppercase letter is
    ///   prefixed with `_` and the whole is uppercased.
    /// - otherwise the name passes through unchanged.
    pub fn normalize(raw: &str) -> MessageName {
        if raw == "sF2pPremiumUserPermission" {
            return MessageName("S_F2P_PremiumUser_Permission".to_string());
        }
        if !raw.contains('_') {
            let mut out = String::with_capacity(raw.len() * 2);
            for ch in raw.chars() {
                if ch.is_ascii_uppercase() {
                    out.push('_');
                }
                out.push(ch);
            }
            return MessageName(out.to_uppercase());
        }
        MessageName(raw.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        self.0 == Self::WILDCARD
    }
}

impl From<&str> for MessageName {
    fn from(raw: &str) -> Self {
        if raw == Self::WILDCARD {
            MessageName(raw.to_string())
        } else {
            MessageName::normalize(raw)
        }
    }
}

/// A codec schema revision independent of the wire protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionVersion {
    /// An exact schema version.
    Exact(u32),
    /// `*` / `'latest'` — the latest known schema for this name.
    Latest,
    /// `raw` — no parsing; the hook sees the byte buffer directly.
    Raw,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalize_special_case() {
        assert_eq!(
            MessageName::normalize("sF2pPremiumUserPermission").as_str(),
            "S_F2P_PremiumUser_Permission"
        );
    }

    #[test]
    fn normalize_camel_case_without_underscore() {
        assert_eq!(MessageName::normalize("sLogin").as_str(), "S_LOGIN");
        assert_eq!(MessageName::normalize("cCheckVersion").as_str(), "C_CHECK_VERSION");
    }

    #[test]
    fn normalize_passes_through_with_underscore() {
        assert_eq!(MessageName::normalize("S_LOGIN").as_str(), "S_LOGIN");
        assert_eq!(MessageName::normalize("already_snake").as_str(), "already_snake");
    }

    #[test]
    fn message_round_trip() {
        let raw = vec![8u8, 0, 0x34, 0x12, 0xaa, 0xbb, 0xcc, 0xdd];
        let msg = Message::from_bytes(raw.clone()).unwrap();
        assert_eq!(msg.opcode(), 0x1234);
        assert_eq!(msg.payload(), &[0xaa, 0xbb, 0xcc, 0xdd]);
        assert_eq!(msg.as_bytes(), &raw[..]);
    }

    #[test]
    fn message_rejects_short_buffers() {
        assert!(Message::from_bytes(vec![1, 0, 0]).is_err());
    }

    #[test]
    fn message_rejects_length_mismatch() {
        assert!(Message::from_bytes(vec![9, 0, 0x12, 0x34, 0xaa]).is_err());
    }
}
