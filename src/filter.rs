//! Hook filter predicate: the tri-state match a hook's registration can
//! place on the live dispatch state before it fires.

/// Four tri-state fields: `Some(true)`/`Some(false)` demand a value, `None`
/// means "don't care". Defaults: `{fake: Some(false), incoming: None,
/// modified: None, silenced: Some(false)}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Filter {
    pub fake: Option<bool>,
    pub incoming: Option<bool>,
    pub modified: Option<bool>,
    pub silenced: Option<bool>,
}

impl Default for Filter {
    fn default() -> Self {
        Filter {
            fake: Some(false),
            incoming: None,
            modified: None,
            silenced: Some(false),
        }
    }
}

/// The running direction/mutation state a hook sees at the moment it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchState {
    pub fake: bool,
    pub incoming: bool,
    pub modified: bool,
    pub silenced: bool,
}

/// Read-only snapshot handed to a parsed hook alongside its event, rather
/// than mutable properties stashed on the event itself.
pub type HookContext = DispatchState;

impl Filter {
    /// A filter field of `None` always agrees; `Some(v)` agrees only when
    /// the live state equals `v`.
    pub fn matches(&self, state: DispatchState) -> bool {
        Self::agrees(self.fake, state.fake)
            && Self::agrees(self.incoming, state.incoming)
            && Self::agrees(self.modified, state.modified)
            && Self::agrees(self.silenced, state.silenced)
    }

    fn agrees(want: Option<bool>, have: bool) -> bool {
        match want {
            None => true,
            Some(v) => v == have,
        }
    }
}
