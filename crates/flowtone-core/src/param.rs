use std::any::Any;
use std::collections::HashMap;

use crate::uid::Uid;

/// Deferred mutation applied to a stage before its next work call.
///
/// The closure receives the target stage as `&mut dyn Any` and reports
/// whether the downcast to the concrete stage type succeeded.
pub type ParamFn = Box<dyn FnOnce(&mut dyn Any) -> bool + Send>;

/// A single addressed parameter mutation.
pub struct Param {
    pub target: Uid,
    pub apply: ParamFn,
}

impl Param {
    /// Wraps a typed mutation of stage type `T` addressed to `target`.
    ///
    /// Stages publish their own constructors on top of this (e.g. a mock
    /// pump's `value_param`); the runtime never inspects the payload.
    pub fn new<T, F>(target: Uid, f: F) -> Self
    where
        T: Any,
        F: FnOnce(&mut T) + Send + 'static,
    {
        Self {
            target,
            apply: Box::new(move |stage| match stage.downcast_mut::<T>() {
                Some(stage) => {
                    f(stage);
                    true
                },
                None => false,
            }),
        }
    }
}

impl std::fmt::Debug for Param {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Param").field("target", &self.target).finish_non_exhaustive()
    }
}

/// Ordered parameter mutations keyed by target uid.
///
/// Not `Clone`: apply closures are single-shot, which is what gives the
/// runtime its at-most-once delivery guarantee.
#[derive(Default)]
pub struct Params {
    map: HashMap<Uid, Vec<ParamFn>>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `param` to the ordered list for its target uid.
    pub fn add(&mut self, param: Param) {
        self.map.entry(param.target).or_default().push(param.apply);
    }

    /// Concatenates `other` into `self`, preserving relative order within
    /// each source.
    pub fn merge(&mut self, other: Params) {
        for (uid, fns) in other.map {
            self.map.entry(uid).or_default().extend(fns);
        }
    }

    /// Removes and returns the ordered list for `uid`, leaving the rest
    /// intact.
    pub fn detach(&mut self, uid: Uid) -> Vec<ParamFn> {
        self.map.remove(&uid).unwrap_or_default()
    }

    /// Appends an already-boxed apply to the list for `uid`. Counterpart of
    /// [`Params::detach`] for re-homing detached entries.
    pub fn attach(&mut self, uid: Uid, apply: ParamFn) {
        self.map.entry(uid).or_default().push(apply);
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Replaces `self` with an empty map and returns the previous contents.
    pub fn take(&mut self) -> Params {
        std::mem::take(self)
    }

    pub fn targets(&self) -> impl Iterator<Item = Uid> + '_ {
        self.map.keys().copied()
    }
}

impl FromIterator<Param> for Params {
    fn from_iter<I: IntoIterator<Item = Param>>(iter: I) -> Self {
        let mut params = Params::new();
        for param in iter {
            params.add(param);
        }
        params
    }
}

impl std::fmt::Debug for Params {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.map.iter().map(|(uid, fns)| (uid, fns.len())))
            .finish()
    }
}
