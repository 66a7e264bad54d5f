//! Error taxonomy for the relay core.
use thiserror::Error;

/// Errors that can escape the core layer.
///
/// `Framing`/`Crypto` are fatal for a connection and propagate up to the
/// `Connection`, which closes both sockets. `Codec`/`Hook`/`Module`/
/// `Registration` are always logged and absorbed at the point they occur —
/// they never escape a single message's processing loop.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("framing error: {0}")]
    Framing(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("codec error at opcode {opcode:#06x} ({call_site}): {message}")]
    Codec {
        opcode: u16,
        call_site: &'static str,
        message: String,
    },

    #[error("hook error in module {module:?} (hook on code {code}): {source}")]
    Hook {
        module: Option<String>,
        code: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("module error ({op}) for module {name:?}: {source}")]
    Module {
        op: &'static str,
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("registration error: {0}")]
    Registration(String),
}

pub type ProxyResult<T> = Result<T, ProxyError>;
