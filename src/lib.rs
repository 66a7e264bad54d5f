//! Core of a man-in-the-middle game-protocol proxy: stream splice, hook
//! dispatch, and module lifecycle. See the module-level docs of each piece
//! for the corresponding design section.
pub mod buffer;
pub mod cipher;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod message;
pub mod module;
pub mod registry;
pub mod server;

pub use cipher::{Cipher, XChaChaKeystreamCipher};
pub use codec::{JsonProtocolCodec, ProtocolCodec};
pub use config::{ConnectOptions, ListenOptions};
pub use dispatcher::{Dispatcher, HandleOutcome, HookHandle, HookOpts, HookRequest, HookType, VersionSpec, Wrapper};
pub use error::{ProxyError, ProxyResult};
pub use filter::{DispatchState, Filter, HookContext};
pub use message::{DefinitionVersion, HookCode, Message, MessageName};
pub use module::GameModule;
pub use registry::{Event, RawHookReturn};
pub use server::create_server;
