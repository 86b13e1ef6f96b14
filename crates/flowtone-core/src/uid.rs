use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_UID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an addressable pipeline component.
///
/// Uids key parameter routing and error tagging. They are never reused
/// within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid(u64);

impl Uid {
    pub fn next() -> Self {
        Self(NEXT_UID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::Uid;

    #[test]
    fn uids_are_unique() {
        let a = Uid::next();
        let b = Uid::next();
        assert_ne!(a, b);
    }
}
