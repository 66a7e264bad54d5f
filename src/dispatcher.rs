//! Hook registration and message dispatch: accept a request, normalize it,
//! act, log and continue on failure — applied to opcode-oriented binary
//! messages rather than line-oriented text commands.
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec::ProtocolCodec;
use crate::config;
use crate::error::ProxyError;
use crate::filter::{DispatchState, Filter, HookContext};
use crate::message::{DefinitionVersion, HookCode, Message, MessageName};
use crate::module::ModuleHost;
use crate::registry::{Event, Hook, HookKind, HookRegistry, ParsedCallback, RawCallback, RawHookReturn};

/// Either a concrete schema revision, the latest known one, or raw bytes.
/// Mirrors `DefinitionVersion` but is the argument shape callers build —
/// kept distinct so the caller-facing token stays separate from the
/// resolved, codec-independent `DefinitionVersion` stored on a `Hook`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSpec {
    Exact(u32),
    Latest,
    Raw,
}

impl VersionSpec {
    /// `'latest'` ⇒ latest. Any other non-integer, non-`'raw'` token ⇒
    /// latest.
    pub fn from_token(token: &str) -> VersionSpec {
        if let Ok(n) = token.parse::<u32>() {
            return VersionSpec::Exact(n);
        }
        if token.eq_ignore_ascii_case("raw") {
            return VersionSpec::Raw;
        }
        VersionSpec::Latest
    }

    fn to_definition(self) -> DefinitionVersion {
        match self {
            VersionSpec::Exact(n) => DefinitionVersion::Exact(n),
            VersionSpec::Latest => DefinitionVersion::Latest,
            VersionSpec::Raw => DefinitionVersion::Raw,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HookOpts {
    pub order: i32,
    pub filter: Filter,
}

impl Default for HookOpts {
    fn default() -> Self {
        HookOpts { order: 0, filter: Filter::default() }
    }
}

/// The deprecated `opts.type` shortcut, folded into `filter.fake`.
#[derive(Debug, Clone, Copy)]
pub enum HookType {
    All,
    Fake,
    Real,
}

impl HookType {
    fn into_filter_fake(self) -> Option<bool> {
        match self {
            HookType::All => None,
            HookType::Fake => Some(true),
            HookType::Real => Some(false),
        }
    }
}

/// A builder for one hook registration: name-only and name+version
/// shortcuts as convenience constructors on top of the explicit record.
#[derive(Debug, Clone)]
pub struct HookRequest {
    pub name: String,
    pub version: VersionSpec,
    pub opts: HookOpts,
    pub module_name: Option<String>,
    implied_version: bool,
}

impl HookRequest {
    /// `(name, cb)` — version defaults to latest (with a warning unless
    /// `NO_WARN_IMPLIED_VERSION` is set), `opts = {}`.
    pub fn new(name: impl Into<String>) -> Self {
        HookRequest {
            name: name.into(),
            version: VersionSpec::Latest,
            opts: HookOpts::default(),
            module_name: None,
            implied_version: true,
        }
    }

    /// `(name, version, cb)`.
    pub fn versioned(name: impl Into<String>, version: VersionSpec) -> Self {
        HookRequest {
            name: name.into(),
            version,
            opts: HookOpts::default(),
            module_name: None,
            implied_version: false,
        }
    }

    pub fn with_opts(mut self, opts: HookOpts) -> Self {
        self.opts = opts;
        self
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.opts.order = order;
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.opts.filter = filter;
        self
    }

    /// Deprecated `opts.type` shortcut.
    pub fn with_type(mut self, hook_type: HookType) -> Self {
        self.opts.filter.fake = hook_type.into_filter_fake();
        self
    }

    pub fn tagged(mut self, module_name: impl Into<String>) -> Self {
        self.module_name = Some(module_name.into());
        self
    }
}

/// A queued-hook handle is stable even before materialization.
#[derive(Debug, Clone, Copy)]
pub enum HookHandle {
    Pending(u64),
    Live { code: HookCode, order: i32, id: u64 },
}

struct QueuedHook {
    req: HookRequest,
    kind: HookKind,
}

pub enum SynthTarget {
    ToClient,
    ToServer,
}

enum SynthEntry {
    /// Sent as-is, bypassing the hook chain entirely.
    Verbatim { target: SynthTarget, bytes: Vec<u8> },
    /// Re-enters `handle` with `fake = true` once control returns to the
    /// connection's drive loop — never recursed into synchronously from
    /// inside a hook.
    ForHandle { target: SynthTarget, bytes: Vec<u8> },
}

pub enum PendingSynth {
    Verbatim { target: SynthTarget, bytes: Vec<u8> },
    ForHandle { target: SynthTarget, message: Message },
}

pub enum HandleOutcome {
    Forward(Message),
    Silenced,
}

struct DispatcherInner {
    registry: HookRegistry,
    codec: Arc<dyn ProtocolCodec>,
    protocol_version: u32,
    check_version_opcode: u16,
    queued: Vec<Option<QueuedHook>>,
    pending_synth: Vec<SynthEntry>,
    module_host: ModuleHost,
}

/// Owns the `HookRegistry` and the `ModuleHost`. Cheaply cloneable — every
/// `Wrapper` holds a clone as its strong handle back to the dispatcher.
#[derive(Clone)]
pub struct Dispatcher(Arc<Mutex<DispatcherInner>>);

impl Dispatcher {
    pub fn new(codec: Arc<dyn ProtocolCodec>, check_version_opcode: u16) -> Self {
        Dispatcher(Arc::new(Mutex::new(DispatcherInner {
            registry: HookRegistry::new(),
            codec,
            protocol_version: 0,
            check_version_opcode,
            queued: Vec::new(),
            pending_synth: Vec::new(),
            module_host: ModuleHost::new(),
        })))
    }

    pub fn protocol_version(&self) -> u32 {
        self.0.lock().protocol_version
    }

    // ---- registration -----------------------------------------------------

    pub fn hook_raw(&self, req: HookRequest, callback: RawCallback) -> HookHandle {
        self.hook(req, HookKind::Raw(callback))
    }

    pub fn hook_parsed(&self, req: HookRequest, callback: ParsedCallback) -> HookHandle {
        self.hook(req, HookKind::Parsed(callback))
    }

    fn hook(&self, req: HookRequest, kind: HookKind) -> HookHandle {
        let mut inner = self.0.lock();
        if inner.protocol_version == 0 {
            let slot = inner.queued.len() as u64;
            inner.queued.push(Some(QueuedHook { req, kind }));
            return HookHandle::Pending(slot);
        }
        let id = inner.registry.next_id();
        let hook = materialize(&mut inner, id, req, kind);
        let code = hook.code;
        let order = hook.order;
        inner.registry.add(hook);
        HookHandle::Live { code, order, id }
    }

    pub fn unhook(&self, handle: HookHandle) {
        let mut inner = self.0.lock();
        match handle {
            HookHandle::Pending(slot) => {
                if let Some(entry) = inner.queued.get_mut(slot as usize) {
                    *entry = None;
                }
            }
            HookHandle::Live { code, order, id } => inner.registry.remove(code, order, id),
        }
    }

    /// Drains the queued-hooks list in registration order once the wire
    /// protocol version becomes known.
    pub fn set_protocol_version(&self, version: u32) {
        let mut inner = self.0.lock();
        if version == 0 {
            println!("[DISPATCH] setProtocolVersion(0) is a no-op");
            return;
        }
        inner.protocol_version = version;
        println!("[DISPATCH] protocol version set to {version}");
        let queued = std::mem::take(&mut inner.queued);
        for entry in queued.into_iter().flatten() {
            let id = inner.registry.next_id();
            let hook = materialize(&mut inner, id, entry.req, entry.kind);
            inner.registry.add(hook);
        }
    }

    // ---- message handling ---------------------------------------------

    pub fn handle(&self, data: Message, incoming: bool, fake: bool) -> HandleOutcome {
        let code = data.opcode();

        // Take the registry and copy out the small bits of state the hook
        // loop needs, then drop the lock before running any hook callback.
        // A hook's intended way of producing output is `Wrapper::to_client`/
        // `to_server`, which locks this same mutex — holding it across the
        // loop would self-deadlock the very first time a hook used them.
        let (mut registry, codec, protocol_version) = {
            let mut inner = self.0.lock();
            maybe_detect_protocol_version(&mut inner, &data, code);
            if !inner.registry.has_any(code) {
                return HandleOutcome::Forward(data);
            }
            let registry = std::mem::take(&mut inner.registry);
            (registry, inner.codec.clone(), inner.protocol_version)
        };

        let copy = data.as_bytes().to_vec();
        let mut current = data.into_bytes();
        let mut modified = false;
        let mut silenced = false;
        let mut aborted = false;

        for hook in registry.merged_for_mut(code) {
            let state = DispatchState { fake, incoming, modified, silenced };
            if !hook.filter.matches(state) {
                continue;
            }
            match &mut hook.kind {
                HookKind::Raw(cb) => {
                    let result = catch_unwind(AssertUnwindSafe(|| cb(code, &current, incoming, fake)));
                    match result {
                        Ok(RawHookReturn::NoChange) => {
                            modified = modified || current != copy;
                        }
                        Ok(RawHookReturn::Buffer(buf)) => {
                            if buf.len() != current.len() || buf != current {
                                modified = true;
                            }
                            current = buf;
                        }
                        Ok(RawHookReturn::Bool(unsilence)) => {
                            silenced = !unsilence;
                        }
                        Err(_) => {
                            println!(
                                "[HOOK] raw hook for module {:?} on code {} panicked, continuing",
                                hook.module_name, hook.code
                            );
                        }
                    }
                }
                HookKind::Parsed(cb) => {
                    match codec_parse(codec.as_ref(), protocol_version, code, hook.definition_version, &current) {
                        Ok(mut event) => {
                            let ctx = HookContext { fake, incoming, modified, silenced };
                            let result = catch_unwind(AssertUnwindSafe(|| cb(&ctx, &mut event)));
                            match result {
                                Ok(true) => {
                                    silenced = false;
                                    match codec_write(codec.as_ref(), protocol_version, code, hook.definition_version, &event) {
                                        Ok(framed) => {
                                            current = framed;
                                            modified = true;
                                        }
                                        Err(e) => {
                                            println!("[DISPATCH] write failed for code {code}: {e}");
                                        }
                                    }
                                }
                                Ok(false) => silenced = true,
                                Err(_) => {
                                    println!(
                                        "[HOOK] parsed hook for module {:?} on code {} panicked, continuing",
                                        hook.module_name, hook.code
                                    );
                                }
                            }
                        }
                        Err(e) => {
                            println!("[DISPATCH] parse failed for code {code}: {e}; aborting hook chain");
                            aborted = true;
                            break;
                        }
                    }
                }
            }
        }

        {
            let mut inner = self.0.lock();
            inner.registry = registry;
        }

        if aborted {
            return HandleOutcome::Forward(Message::from_trusted(current));
        }
        if silenced {
            return HandleOutcome::Silenced;
        }
        HandleOutcome::Forward(Message::from_trusted(current))
    }

    // ---- outbound synthesis -----------------------------------------------

    pub fn write_raw(&self, target: SynthTarget, bytes: Vec<u8>) {
        self.0.lock().pending_synth.push(SynthEntry::Verbatim { target, bytes });
    }

    pub fn write_named(&self, target: SynthTarget, name: &str, version: DefinitionVersion, event: &Event) {
        let mut inner = self.0.lock();
        let normalized = MessageName::from(name);
        let code = match inner.codec.name_to_code(inner.protocol_version, &normalized) {
            Some(c) => c,
            None => {
                println!("[DISPATCH] write(): unresolved message name {name:?}");
                return;
            }
        };
        match inner.codec.write(inner.protocol_version, code, version, event) {
            Ok(payload) => {
                let framed = frame(code, &payload);
                inner.pending_synth.push(SynthEntry::ForHandle { target, bytes: framed });
            }
            Err(e) => println!("[DISPATCH] write(): codec failed for {name:?}: {e}"),
        }
    }

    /// Drains messages synthesized during the last `handle`/`write` call.
    /// The caller (the owning `Connection`) processes these *after* the
    /// triggering `handle` call has returned.
    pub fn take_pending_synth(&self) -> Vec<PendingSynth> {
        let mut inner = self.0.lock();
        std::mem::take(&mut inner.pending_synth)
            .into_iter()
            .map(|entry| match entry {
                SynthEntry::Verbatim { target, bytes } => PendingSynth::Verbatim { target, bytes },
                SynthEntry::ForHandle { target, bytes } => {
                    PendingSynth::ForHandle { target, message: Message::from_trusted(bytes) }
                }
            })
            .collect()
    }

    // ---- module lifecycle (delegates into ModuleHost) --------------------

    /// Construct and register a module. A second `load` for an already
    /// loaded (or mid-construction) name is not an error — it returns the
    /// same success as the original load. `construct` runs with no
    /// dispatcher lock held, so it can freely call back into `Wrapper`
    /// (register hooks, load further modules) without deadlocking.
    pub fn load_module(
        &self,
        name: &str,
        construct: impl FnOnce(Wrapper) -> anyhow::Result<Box<dyn crate::module::GameModule>>,
    ) -> Option<()> {
        let wrapper = Wrapper { dispatcher: self.clone(), module_name: name.to_string() };
        {
            let mut inner = self.0.lock();
            if !inner.module_host.begin_load(name) {
                println!("[MODULE] load({name:?}) already loaded, returning existing instance");
                return Some(());
            }
        }
        match construct(wrapper) {
            Ok(instance) => {
                let mut inner = self.0.lock();
                inner.module_host.finish_load(name, instance);
                println!("[MODULE] loaded {name:?}");
                Some(())
            }
            Err(e) => {
                println!("[MODULE] failed to construct {name:?}: {e}");
                let mut inner = self.0.lock();
                inner.module_host.abort_load(name);
                None
            }
        }
    }

    /// Runs the module's destructor with no dispatcher lock held — a module
    /// whose destructor calls back into its own `Wrapper` must not deadlock.
    pub fn unload_module(&self, name: &str) -> bool {
        let instance = {
            let mut inner = self.0.lock();
            let instance = inner.module_host.take_for_unload(name);
            if instance.is_some() {
                inner.registry.remove_by_module(name);
            }
            instance
        };
        match instance {
            Some(mut instance) => {
                if let Err(e) = instance.destructor() {
                    println!("[MODULE] destructor for {name:?} failed: {e}");
                }
                println!("[MODULE] unloaded {name:?}");
                true
            }
            None => false,
        }
    }

    /// Returns the dispatcher to a clean slate: unloads every module (running
    /// destructors unlocked), drops all hooks, forgets the detected wire
    /// protocol version, and discards anything still queued or pending.
    pub fn reset(&self) {
        let instances: Vec<(String, Box<dyn crate::module::GameModule>)> = {
            let mut inner = self.0.lock();
            let names = inner.module_host.module_names();
            let instances = names
                .into_iter()
                .filter_map(|name| {
                    let instance = inner.module_host.take_for_unload(&name)?;
                    Some((name, instance))
                })
                .collect();
            inner.registry = HookRegistry::new();
            inner.protocol_version = 0;
            inner.queued.clear();
            inner.pending_synth.clear();
            instances
        };
        for (name, mut instance) in instances {
            if let Err(e) = instance.destructor() {
                println!("[MODULE] destructor for {name:?} failed: {e}");
            }
        }
    }
}

fn codec_parse(
    codec: &dyn ProtocolCodec,
    protocol_version: u32,
    code: u16,
    def_version: DefinitionVersion,
    framed: &[u8],
) -> Result<Event, ProxyError> {
    codec.parse(protocol_version, code, def_version, &framed[4..])
}

fn codec_write(
    codec: &dyn ProtocolCodec,
    protocol_version: u32,
    code: u16,
    def_version: DefinitionVersion,
    event: &Event,
) -> Result<Vec<u8>, ProxyError> {
    let payload = codec.write(protocol_version, code, def_version, event)?;
    Ok(frame(code, &payload))
}

fn frame(code: u16, payload: &[u8]) -> Vec<u8> {
    let total = 4 + payload.len();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u16).to_le_bytes());
    out.extend_from_slice(&code.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

fn maybe_detect_protocol_version(inner: &mut DispatcherInner, data: &Message, code: u16) {
    if code != inner.check_version_opcode || inner.protocol_version != 0 {
        return;
    }
    let event = match inner.codec.parse(0, code, DefinitionVersion::Latest, data.payload()) {
        Ok(event) => event,
        Err(e) => {
            println!("[DISPATCH] failed to parse {} for version detection: {e}", inner.check_version_opcode);
            return;
        }
    };
    if let Some(version) = extract_check_version(&event) {
        drop_and_set_version(inner, version);
    }
}

/// `version[0].value`, requiring `index == 0`.
fn extract_check_version(event: &Event) -> Option<u32> {
    let entries = event.get("version")?.as_array()?;
    let first = entries.iter().find(|e| e.get("index").and_then(|i| i.as_u64()) == Some(0))?;
    first.get("value")?.as_u64().map(|v| v as u32)
}

fn drop_and_set_version(inner: &mut DispatcherInner, version: u32) {
    inner.protocol_version = version;
    println!("[DISPATCH] protocol version detected from C_CHECK_VERSION: {version}");
    let queued = std::mem::take(&mut inner.queued);
    for entry in queued.into_iter().flatten() {
        let id = inner.registry.next_id();
        let hook = materialize(inner, id, entry.req, entry.kind);
        inner.registry.add(hook);
    }
}

fn materialize(inner: &mut DispatcherInner, id: u64, mut req: HookRequest, kind: HookKind) -> Hook {
    let is_wildcard = req.name == MessageName::WILDCARD;
    let code = if is_wildcard {
        if matches!(req.version, VersionSpec::Exact(_)) {
            println!("[DISPATCH] registration error: name '*' forbids an integer version; using latest");
            req.version = VersionSpec::Latest;
        }
        HookCode::Any
    } else {
        let normalized = MessageName::from(req.name.as_str());
        match inner.codec.name_to_code(inner.protocol_version, &normalized) {
            Some(c) => HookCode::Code(c),
            None => {
                println!("[DISPATCH] registration error: unresolved message name {:?}", req.name);
                HookCode::Unknown
            }
        }
    };

    if !is_wildcard {
        if let VersionSpec::Exact(n) = req.version {
            let normalized = MessageName::from(req.name.as_str());
            if let Some(latest) = inner.codec.latest_definition_version(&normalized) {
                if n < latest {
                    println!(
                        "[DISPATCH] warning: hook on {:?} requests definition version {n}, latest known is {latest}",
                        req.name
                    );
                }
            }
        }
    }

    if req.implied_version && config::warn_on_implied_version() {
        println!("[DISPATCH] warning: hook on {:?} registered without an explicit version, implying latest", req.name);
    }

    Hook {
        id,
        code,
        filter: req.opts.filter,
        order: req.opts.order,
        definition_version: req.version.to_definition(),
        module_name: req.module_name,
        kind,
    }
}

/// The capability-restricted view handed to a loaded module. Every hook it
/// registers is pre-tagged with the owning module's name so
/// `unload_module` can revoke them by that name alone.
#[derive(Clone)]
pub struct Wrapper {
    dispatcher: Dispatcher,
    module_name: String,
}

impl Wrapper {
    pub fn hook_raw(&self, req: HookRequest, callback: RawCallback) -> HookHandle {
        self.dispatcher.hook_raw(req.tagged(self.module_name.clone()), callback)
    }

    pub fn hook_parsed(&self, req: HookRequest, callback: ParsedCallback) -> HookHandle {
        self.dispatcher.hook_parsed(req.tagged(self.module_name.clone()), callback)
    }

    pub fn unhook(&self, handle: HookHandle) {
        self.dispatcher.unhook(handle)
    }

    pub fn to_client(&self, bytes: Vec<u8>) {
        self.dispatcher.write_raw(SynthTarget::ToClient, bytes)
    }

    pub fn to_server(&self, bytes: Vec<u8>) {
        self.dispatcher.write_raw(SynthTarget::ToServer, bytes)
    }

    pub fn load(
        &self,
        name: &str,
        construct: impl FnOnce(Wrapper) -> anyhow::Result<Box<dyn crate::module::GameModule>>,
    ) -> Option<()> {
        self.dispatcher.load_module(name, construct)
    }

    pub fn unload(&self, name: &str) -> bool {
        self.dispatcher.unload_module(name)
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonProtocolCodec;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashMap;

    fn codec_with(opcode: u16, name: &str) -> Arc<dyn ProtocolCodec> {
        let mut names = HashMap::new();
        names.insert(name.to_string(), opcode);
        names.insert("C_CHECK_VERSION".to_string(), 19900);
        let mut maps = HashMap::new();
        maps.insert(1u32, names);
        Arc::new(JsonProtocolCodec::from_tables(maps, HashMap::new()))
    }

    fn framed_json(code: u16, event: &Event) -> Message {
        let payload = serde_json::to_vec(event).unwrap();
        Message::from_trusted(frame(code, &payload))
    }

    #[test]
    fn handle_is_identity_with_no_hooks() {
        let dispatcher = Dispatcher::new(codec_with(100, "S_LOGIN"), 19900);
        dispatcher.set_protocol_version(1);
        let msg = framed_json(100, &json!({"a": 1}));
        let original = msg.as_bytes().to_vec();
        match dispatcher.handle(msg, true, false) {
            HandleOutcome::Forward(out) => assert_eq!(out.as_bytes(), &original[..]),
            HandleOutcome::Silenced => panic!("unexpected silence"),
        }
    }

    #[test]
    fn raw_hook_returning_false_silences_and_true_clears_it() {
        let dispatcher = Dispatcher::new(codec_with(100, "S_LOGIN"), 19900);
        dispatcher.set_protocol_version(1);
        dispatcher.hook_raw(HookRequest::versioned("S_LOGIN", VersionSpec::Raw).with_order(0), Box::new(|_, _, _, _| RawHookReturn::Bool(false)));
        dispatcher.hook_raw(HookRequest::versioned("S_LOGIN", VersionSpec::Raw).with_order(1), Box::new(|_, _, _, _| RawHookReturn::Bool(true)));
        let msg = framed_json(100, &json!({}));
        match dispatcher.handle(msg, true, false) {
            HandleOutcome::Forward(_) => {}
            HandleOutcome::Silenced => panic!("later hook should have un-silenced"),
        }
    }

    #[test]
    fn single_false_hook_silences() {
        let dispatcher = Dispatcher::new(codec_with(100, "S_LOGIN"), 19900);
        dispatcher.set_protocol_version(1);
        dispatcher.hook_raw(HookRequest::versioned("S_LOGIN", VersionSpec::Raw), Box::new(|_, _, _, _| RawHookReturn::Bool(false)));
        let msg = framed_json(100, &json!({}));
        assert!(matches!(dispatcher.handle(msg, true, false), HandleOutcome::Silenced));
    }

    #[test]
    fn parsed_hook_round_trips_unmodified_event() {
        let dispatcher = Dispatcher::new(codec_with(100, "S_LOGIN"), 19900);
        dispatcher.set_protocol_version(1);
        dispatcher.hook_parsed(
            HookRequest::versioned("S_LOGIN", VersionSpec::Latest),
            Box::new(|_, _event| true),
        );
        let original_event = json!({"hp": 42});
        let msg = framed_json(100, &original_event);
        match dispatcher.handle(msg, true, false) {
            HandleOutcome::Forward(out) => {
                let parsed: Event = serde_json::from_slice(out.payload()).unwrap();
                assert_eq!(parsed, original_event);
            }
            HandleOutcome::Silenced => panic!("unexpected silence"),
        }
    }

    #[test]
    fn parse_failure_aborts_chain_and_returns_current_buffer() {
        let dispatcher = Dispatcher::new(codec_with(100, "S_LOGIN"), 19900);
        dispatcher.set_protocol_version(1);
        dispatcher.hook_parsed(HookRequest::versioned("S_LOGIN", VersionSpec::Latest), Box::new(|_, _| true));
        // Not valid JSON payload -> parse fails.
        let bytes = frame(100, b"\xff\xfe not json");
        let msg = Message::from_trusted(bytes.clone());
        match dispatcher.handle(msg, true, false) {
            HandleOutcome::Forward(out) => assert_eq!(out.as_bytes(), &bytes[..]),
            HandleOutcome::Silenced => panic!("parse failure must forward, never silence"),
        }
    }

    #[test]
    fn queued_hooks_materialize_in_order_on_version_detection() {
        let dispatcher = Dispatcher::new(codec_with(100, "S_LOGIN"), 19900);
        let handle = dispatcher.hook_raw(HookRequest::new("S_LOGIN"), Box::new(|_, _, _, _| RawHookReturn::NoChange));
        assert!(matches!(handle, HookHandle::Pending(_)));
        assert_eq!(dispatcher.protocol_version(), 0);

        let check_version_event = json!({"version": [{"index": 0, "value": 361000}]});
        let check_msg = framed_json(19900, &check_version_event);
        let _ = dispatcher.handle(check_msg, true, false);
        assert_eq!(dispatcher.protocol_version(), 361000);

        let msg = framed_json(100, &json!({}));
        let original = msg.as_bytes().to_vec();
        match dispatcher.handle(msg, true, false) {
            HandleOutcome::Forward(out) => assert_eq!(out.as_bytes(), &original[..]),
            HandleOutcome::Silenced => panic!("no-op hook should not silence"),
        }
    }

    #[test]
    fn unhook_pending_is_idempotent_and_prevents_materialization() {
        let dispatcher = Dispatcher::new(codec_with(100, "S_LOGIN"), 19900);
        let handle = dispatcher.hook_raw(HookRequest::new("S_LOGIN"), Box::new(|_, _, _, _| RawHookReturn::Bool(false)));
        dispatcher.unhook(handle);
        dispatcher.unhook(handle);
        dispatcher.set_protocol_version(1);
        let msg = framed_json(100, &json!({}));
        assert!(matches!(dispatcher.handle(msg, true, false), HandleOutcome::Forward(_)));
    }

    #[test]
    fn wildcard_name_forbids_integer_version() {
        let dispatcher = Dispatcher::new(codec_with(100, "S_LOGIN"), 19900);
        dispatcher.set_protocol_version(1);
        let handle = dispatcher.hook_raw(
            HookRequest::versioned("*", VersionSpec::Exact(3)),
            Box::new(|_, _, _, _| RawHookReturn::NoChange),
        );
        match handle {
            HookHandle::Live { code, .. } => assert_eq!(code, HookCode::Any),
            HookHandle::Pending(_) => panic!("protocol version already known"),
        }
    }

    #[test]
    fn unresolved_name_installs_against_unknown_sentinel() {
        let dispatcher = Dispatcher::new(codec_with(100, "S_LOGIN"), 19900);
        dispatcher.set_protocol_version(1);
        let handle = dispatcher.hook_raw(HookRequest::new("S_NO_SUCH_MESSAGE"), Box::new(|_, _, _, _| RawHookReturn::NoChange));
        match handle {
            HookHandle::Live { code, .. } => assert_eq!(code, HookCode::Unknown),
            HookHandle::Pending(_) => panic!("protocol version already known"),
        }
    }
}
