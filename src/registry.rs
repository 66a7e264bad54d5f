//! Ordered, per-opcode hook storage and the global/specific merge
//! algorithm: an opcode-keyed dispatch table holding an order-sorted
//! `Vec<HookGroup>` per opcode. Globals, concrete opcodes, and the
//! `_UNKNOWN` bucket are kept as separate fields (rather than sentinel
//! keys in one map) so the merge algorithm can borrow the global list and
//! one specific list mutably at the same time.
use std::collections::HashMap;

use crate::filter::{Filter, HookContext};
use crate::message::{DefinitionVersion, HookCode};

pub type Event = serde_json::Value;

/// A raw hook's return value.
pub enum RawHookReturn {
    /// The buffer is unchanged by this call.
    NoChange,
    /// Replace the buffer with this one (modification tracked by comparing
    /// against the snapshot taken before the hook chain ran).
    Buffer(Vec<u8>),
    /// `true` clears silencing, `false` sets it.
    Bool(bool),
}

pub type RawCallback = Box<dyn FnMut(u16, &[u8], bool, bool) -> RawHookReturn + Send>;
/// Returns `true` to clear silencing (re-serializing any event mutation),
/// `false` to silence.
pub type ParsedCallback = Box<dyn FnMut(&HookContext, &mut Event) -> bool + Send>;

pub enum HookKind {
    Raw(RawCallback),
    Parsed(ParsedCallback),
}

/// A single registered callback. Identity is by `id`, assigned at creation
/// — two structurally identical hooks are still distinct registrations.
pub struct Hook {
    pub id: u64,
    pub code: HookCode,
    pub filter: Filter,
    pub order: i32,
    pub definition_version: DefinitionVersion,
    pub module_name: Option<String>,
    pub kind: HookKind,
}

impl Hook {
    pub fn is_raw(&self) -> bool {
        matches!(self.kind, HookKind::Raw(_))
    }
}

/// All hooks sharing one `order` value, in registration order.
pub struct HookGroup {
    pub order: i32,
    pub hooks: Vec<Hook>,
}

fn insert_sorted(groups: &mut Vec<HookGroup>, hook: Hook) {
    match groups.binary_search_by_key(&hook.order, |g| g.order) {
        Ok(idx) => groups[idx].hooks.push(hook),
        Err(idx) => groups.insert(idx, HookGroup { order: hook.order, hooks: vec![hook] }),
    }
}

fn remove_from(groups: &mut Vec<HookGroup>, order: i32, id: u64) {
    if let Ok(idx) = groups.binary_search_by_key(&order, |g| g.order) {
        groups[idx].hooks.retain(|h| h.id != id);
        if groups[idx].hooks.is_empty() {
            groups.remove(idx);
        }
    }
}

fn retain_not_module(groups: &mut Vec<HookGroup>, module_name: &str) {
    for group in groups.iter_mut() {
        group.hooks.retain(|h| h.module_name.as_deref() != Some(module_name));
    }
    groups.retain(|g| !g.hooks.is_empty());
}

#[derive(Default)]
pub struct HookRegistry {
    globals: Vec<HookGroup>,
    specifics: HashMap<u16, Vec<HookGroup>>,
    unknown: Vec<HookGroup>,
    next_id: u64,
}

impl HookRegistry {
    pub fn new() -> Self {
        HookRegistry::default()
    }

    pub fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Insert `hook`, creating or joining the `order`-matched group under
    /// `hook.code`.
    pub fn add(&mut self, hook: Hook) {
        match hook.code {
            HookCode::Any => insert_sorted(&mut self.globals, hook),
            HookCode::Code(c) => insert_sorted(self.specifics.entry(c).or_default(), hook),
            HookCode::Unknown => insert_sorted(&mut self.unknown, hook),
        }
    }

    /// Idempotent removal by hook id.
    pub fn remove(&mut self, code: HookCode, order: i32, id: u64) {
        match code {
            HookCode::Any => remove_from(&mut self.globals, order, id),
            HookCode::Code(c) => {
                if let Some(groups) = self.specifics.get_mut(&c) {
                    remove_from(groups, order, id);
                }
            }
            HookCode::Unknown => remove_from(&mut self.unknown, order, id),
        }
    }

    /// Drop every hook tagged with `module_name`, across all opcodes.
    pub fn remove_by_module(&mut self, module_name: &str) {
        retain_not_module(&mut self.globals, module_name);
        retain_not_module(&mut self.unknown, module_name);
        for groups in self.specifics.values_mut() {
            retain_not_module(groups, module_name);
        }
    }

    /// Hooks that should fire for `code`, in merged-iteration order: global
    /// (`*`) and code-specific groups interleaved by ascending `order`,
    /// globals winning ties, insertion order within a group.
    pub fn merged_for(&self, code: u16) -> Vec<&Hook> {
        let empty: Vec<HookGroup> = Vec::new();
        let specifics = self.specifics.get(&code).unwrap_or(&empty);
        merge_groups(&self.globals, specifics)
    }

    /// Same merge, with mutable access so hook callbacks (`FnMut`) can run.
    pub fn merged_for_mut(&mut self, code: u16) -> Vec<&mut Hook> {
        let globals = &mut self.globals;
        match self.specifics.get_mut(&code) {
            Some(specifics) => merge_groups_mut(globals, specifics),
            None => merge_groups_mut(globals, &mut []),
        }
    }

    /// True if there is at least one hook registered for `code` or `*`.
    pub fn has_any(&self, code: u16) -> bool {
        !self.globals.is_empty() || self.specifics.get(&code).map(|g| !g.is_empty()).unwrap_or(false)
    }
}

fn merge_groups<'a>(globals: &'a [HookGroup], specifics: &'a [HookGroup]) -> Vec<&'a Hook> {
    let mut out = Vec::new();
    let mut gi = 0usize;
    let mut ci = 0usize;
    while gi < globals.len() || ci < specifics.len() {
        let take_global = match (globals.get(gi), specifics.get(ci)) {
            (Some(g), Some(c)) => g.order <= c.order,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => unreachable!(),
        };
        if take_global {
            out.extend(globals[gi].hooks.iter());
            gi += 1;
        } else {
            out.extend(specifics[ci].hooks.iter());
            ci += 1;
        }
    }
    out
}

fn merge_groups_mut<'a>(globals: &'a mut [HookGroup], specifics: &'a mut [HookGroup]) -> Vec<&'a mut Hook> {
    // Two `Peekable` iterators hand out each group's hooks at most once, so
    // the mutable borrows they yield are disjoint by construction.
    let mut out: Vec<&mut Hook> = Vec::new();
    let mut gp = globals.iter_mut().peekable();
    let mut sp = specifics.iter_mut().peekable();
    loop {
        let take_global = match (gp.peek(), sp.peek()) {
            (Some(g), Some(c)) => g.order <= c.order,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        if take_global {
            out.extend(gp.next().unwrap().hooks.iter_mut());
        } else {
            out.extend(sp.next().unwrap().hooks.iter_mut());
        }
    }
    out
}
