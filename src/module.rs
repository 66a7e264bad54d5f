//! Module loading/unloading. Each loaded module gets a `Wrapper` — a
//! capability-scoped handle back to the dispatcher — rather than the whole
//! server surface.
use std::collections::HashMap;

/// A loaded module's behavior. `destructor` defaults to a no-op; override it
/// to release resources the module allocated.
pub trait GameModule: Send {
    fn destructor(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

enum ModuleSlot {
    /// Reserved by `begin_load`; construction is running outside the lock.
    Loading,
    Loaded(Box<dyn GameModule>),
}

/// Tracks loaded modules by name. Owned by the `Dispatcher`'s inner state;
/// the registry's `remove_by_module` call is what actually revokes a
/// module's hooks, kept as a sibling operation rather than folded in here so
/// `ModuleHost` stays ignorant of the hook registry entirely.
///
/// Construction and destructor calls run arbitrary module code, so they must
/// never run while the dispatcher's lock is held (a module that calls back
/// into its `Wrapper` would deadlock on a non-reentrant mutex). This host
/// only ever hands out or takes back a `Box<dyn GameModule>` — it never
/// calls into one — so the caller is free to lock just long enough to
/// reserve a slot or take an instance out, run the module code unlocked,
/// then re-lock to commit the result.
#[derive(Default)]
pub struct ModuleHost {
    records: HashMap<String, ModuleSlot>,
}

impl ModuleHost {
    pub fn new() -> Self {
        ModuleHost::default()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        matches!(self.records.get(name), Some(ModuleSlot::Loaded(_)))
    }

    pub fn module_names(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|(_, slot)| matches!(slot, ModuleSlot::Loaded(_)))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Reserve `name` for construction. Returns `false` (no reservation made)
    /// if `name` is already loaded or is mid-construction by another caller —
    /// a double-load is not a failure, the caller should report success.
    pub fn begin_load(&mut self, name: &str) -> bool {
        if self.records.contains_key(name) {
            return false;
        }
        self.records.insert(name.to_string(), ModuleSlot::Loading);
        true
    }

    /// Commit a successfully constructed module into the slot reserved by
    /// `begin_load`.
    pub fn finish_load(&mut self, name: &str, instance: Box<dyn GameModule>) {
        self.records.insert(name.to_string(), ModuleSlot::Loaded(instance));
    }

    /// Release the slot reserved by `begin_load` after construction failed.
    pub fn abort_load(&mut self, name: &str) {
        self.records.remove(name);
    }

    /// Remove and hand back the loaded instance for `name`, if any, so the
    /// caller can run its destructor unlocked. A module still mid-construction
    /// is left in place — it isn't unloadable yet.
    pub fn take_for_unload(&mut self, name: &str) -> Option<Box<dyn GameModule>> {
        match self.records.get(name) {
            Some(ModuleSlot::Loaded(_)) => match self.records.remove(name) {
                Some(ModuleSlot::Loaded(instance)) => Some(instance),
                _ => unreachable!("checked above"),
            },
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonProtocolCodec;
    use crate::dispatcher::Dispatcher;
    use std::collections::HashMap as Map;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct Recorder(Arc<AtomicBool>);
    impl GameModule for Recorder {
        fn destructor(&mut self) -> anyhow::Result<()> {
            self.0.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(JsonProtocolCodec::from_tables(Map::new(), Map::new())), 19900)
    }

    #[test]
    fn second_load_of_same_name_returns_the_existing_success() {
        let dispatcher = dispatcher();
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = flag.clone();
        let first = dispatcher.load_module("m", move |_w| Ok(Box::new(Recorder(flag2.clone())) as Box<dyn GameModule>));
        let second = dispatcher.load_module("m", move |_w| Ok(Box::new(Recorder(flag.clone())) as Box<dyn GameModule>));
        assert_eq!(first, Some(()));
        assert_eq!(second, Some(()));
    }

    #[test]
    fn unload_runs_destructor_exactly_once() {
        let dispatcher = dispatcher();
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = flag.clone();
        dispatcher.load_module("m", move |_w| Ok(Box::new(Recorder(flag2)) as Box<dyn GameModule>));
        assert!(dispatcher.unload_module("m"));
        assert!(flag.load(Ordering::SeqCst));
        assert!(!dispatcher.unload_module("m"));
    }

    #[test]
    fn a_module_can_reload_itself_from_its_own_constructor() {
        // The construct closure runs with no dispatcher lock held, so it can
        // freely call back into the dispatcher (register hooks, load other
        // modules) without deadlocking.
        let dispatcher = dispatcher();
        let reentered = Arc::new(AtomicBool::new(false));
        let reentered2 = reentered.clone();
        dispatcher.load_module("outer", move |w| {
            w.load("inner", {
                let reentered = reentered2.clone();
                move |_w| {
                    reentered.store(true, Ordering::SeqCst);
                    Ok(Box::new(Recorder(Arc::new(AtomicBool::new(false)))) as Box<dyn GameModule>)
                }
            });
            Ok(Box::new(Recorder(Arc::new(AtomicBool::new(false)))) as Box<dyn GameModule>)
        });
        assert!(reentered.load(Ordering::SeqCst));
    }
}
