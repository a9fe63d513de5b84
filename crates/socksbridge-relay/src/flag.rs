use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One-way "a pump has finished" signal shared by the two pumps of a session.
///
/// Only ever moves from unset to set.
#[derive(Debug, Clone, Default)]
pub struct TerminationFlag {
    finished: Arc<AtomicBool>,
}

impl TerminationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.finished.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

/// Sets the flag when dropped, so every exit path of a pump (including a
/// panic or an aborted task) signals the peer.
pub(crate) struct SetOnDrop(pub(crate) TerminationFlag);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.set();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_starts_unset() {
        assert!(!TerminationFlag::new().is_set());
    }

    #[test]
    fn test_flag_is_shared_between_clones() {
        let flag = TerminationFlag::new();
        let peer = flag.clone();
        flag.set();
        assert!(peer.is_set());

        // Idempotent
        peer.set();
        assert!(flag.is_set());
    }

    #[test]
    fn test_guard_sets_flag_on_drop() {
        let flag = TerminationFlag::new();
        {
            let _guard = SetOnDrop(flag.clone());
            assert!(!flag.is_set());
        }
        assert!(flag.is_set());
    }
}
