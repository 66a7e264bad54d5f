//! The protocol codec contract — out of scope to implement for real, but
//! given a reference implementation here so the rest of the core is testable
//! end to end. Table loading uses a JSON-table pattern
//! (`serde_json::from_str::<HashMap<...>>` behind a process-wide
//! `OnceCell`).
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::Deserialize;

use crate::error::ProxyError;
use crate::message::{DefinitionVersion, MessageName};
use crate::registry::Event;

/// `name <-> opcode` tables are versioned by the wire protocol version;
/// `messages` tracks which definition versions exist for a name,
/// independent of wire protocol version.
pub trait ProtocolCodec: Send + Sync {
    fn name_to_code(&self, protocol_version: u32, name: &MessageName) -> Option<u16>;
    fn code_to_name(&self, protocol_version: u32, code: u16) -> Option<MessageName>;
    /// The latest known definition version for a name, if any is known.
    fn latest_definition_version(&self, name: &MessageName) -> Option<u32>;
    fn parse(
        &self,
        protocol_version: u32,
        code: u16,
        def_version: DefinitionVersion,
        bytes: &[u8],
    ) -> Result<Event, ProxyError>;
    fn write(
        &self,
        protocol_version: u32,
        code: u16,
        def_version: DefinitionVersion,
        event: &Event,
    ) -> Result<Vec<u8>, ProxyError>;
}

#[derive(Debug, Deserialize)]
struct RawTables {
    /// protocol_version (as decimal string) -> name -> opcode
    maps: HashMap<String, HashMap<String, u16>>,
    /// name -> known definition versions
    messages: HashMap<String, Vec<u32>>,
}

struct Tables {
    name_to_code: HashMap<u32, HashMap<String, u16>>,
    code_to_name: HashMap<u32, HashMap<u16, String>>,
    definition_versions: HashMap<String, Vec<u32>>,
}

/// A JSON-table reference codec. Message payloads are themselves
/// JSON-encoded events (`parse` = `serde_json::from_slice`, `write` =
/// `serde_json::to_vec`) — sufficient to exercise every dispatcher
/// invariant without a real game's binary schema set.
pub struct JsonProtocolCodec {
    tables: Arc<RwLock<Tables>>,
}

static EMPTY_NAME_MAP: OnceCell<HashMap<String, u16>> = OnceCell::new();

impl JsonProtocolCodec {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProxyError> {
        let raw = fs::read_to_string(path.as_ref()).map_err(|e| {
            ProxyError::Codec {
                opcode: 0,
                call_site: "JsonProtocolCodec::load",
                message: format!("reading {}: {e}", path.as_ref().display()),
            }
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ProxyError> {
        let parsed: RawTables = serde_json::from_str(raw).map_err(|e| ProxyError::Codec {
            opcode: 0,
            call_site: "JsonProtocolCodec::from_json_str",
            message: e.to_string(),
        })?;
        Ok(Self::from_raw(parsed))
    }

    fn from_raw(raw: RawTables) -> Self {
        let mut name_to_code = HashMap::new();
        let mut code_to_name = HashMap::new();
        for (version_str, names) in raw.maps {
            let version: u32 = version_str.parse().unwrap_or(0);
            let mut rev = HashMap::new();
            for (name, code) in &names {
                rev.insert(*code, name.clone());
            }
            name_to_code.insert(version, names);
            code_to_name.insert(version, rev);
        }
        JsonProtocolCodec {
            tables: Arc::new(RwLock::new(Tables {
                name_to_code,
                code_to_name,
                definition_versions: raw.messages,
            })),
        }
    }

    /// Build directly from in-memory tables (used by tests and by modules
    /// wiring a synthetic schema set at startup).
    pub fn from_tables(
        maps: HashMap<u32, HashMap<String, u16>>,
        messages: HashMap<String, Vec<u32>>,
    ) -> Self {
        let mut code_to_name = HashMap::new();
        for (version, names) in &maps {
            let mut rev = HashMap::new();
            for (name, code) in names {
                rev.insert(*code, name.clone());
            }
            code_to_name.insert(*version, rev);
        }
        JsonProtocolCodec {
            tables: Arc::new(RwLock::new(Tables {
                name_to_code: maps,
                code_to_name,
                definition_versions: messages,
            })),
        }
    }
}

impl ProtocolCodec for JsonProtocolCodec {
    fn name_to_code(&self, protocol_version: u32, name: &MessageName) -> Option<u16> {
        let tables = self.tables.read();
        tables
            .name_to_code
            .get(&protocol_version)
            .unwrap_or_else(|| EMPTY_NAME_MAP.get_or_init(HashMap::new))
            .get(name.as_str())
            .copied()
    }

    fn code_to_name(&self, protocol_version: u32, code: u16) -> Option<MessageName> {
        let tables = self.tables.read();
        tables
            .code_to_name
            .get(&protocol_version)?
            .get(&code)
            .map(|s| MessageName::from(s.as_str()))
    }

    fn latest_definition_version(&self, name: &MessageName) -> Option<u32> {
        let tables = self.tables.read();
        tables
            .definition_versions
            .get(name.as_str())
            .and_then(|versions| versions.iter().copied().max())
    }

    fn parse(
        &self,
        _protocol_version: u32,
        code: u16,
        _def_version: DefinitionVersion,
        bytes: &[u8],
    ) -> Result<Event, ProxyError> {
        serde_json::from_slice(bytes).map_err(|e| ProxyError::Codec {
            opcode: code,
            call_site: "JsonProtocolCodec::parse",
            message: e.to_string(),
        })
    }

    fn write(
        &self,
        _protocol_version: u32,
        code: u16,
        _def_version: DefinitionVersion,
        event: &Event,
    ) -> Result<Vec<u8>, ProxyError> {
        serde_json::to_vec(event).map_err(|e| ProxyError::Codec {
            opcode: code,
            call_site: "JsonProtocolCodec::write",
            message: e.to_string(),
        })
    }
}
