//! Chroot sub-view lifecycle (part of C10, `spec.md` §4.11).
//!
//! `Efs::chroot` produces a new handle sharing the inode store, locks,
//! and crypto context but with an independent descriptor table and
//! current directory. This module only tracks which views are alive so
//! that stopping the root can stop every descendant, per §4.11
//! ("stopping the root instance stops all live sub-views"); `ops.rs`
//! owns the actual `Efs` struct and what "stop" does to it.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Anything `ViewRegistry` can tear down when an ancestor stops.
pub trait StoppableView: Send + Sync {
    fn stop_local(&self);
}

/// Tracks every live view descending from one mounted store.
#[derive(Default)]
pub struct ViewRegistry {
    views: Mutex<Vec<Weak<dyn StoppableView>>>,
}

impl ViewRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, view: Weak<dyn StoppableView>) {
        let mut views = self.views.lock();
        views.retain(|w| w.strong_count() > 0);
        views.push(view);
    }

    /// Stops every still-live registered view, including the caller if
    /// it registered itself.
    pub fn stop_all(&self) {
        let views: Vec<_> = self.views.lock().clone();
        for view in views {
            if let Some(view) = view.upgrade() {
                view.stop_local();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Flag(AtomicBool);
    impl StoppableView for Flag {
        fn stop_local(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn stop_all_reaches_every_live_view() {
        let registry = ViewRegistry::new();
        let a = Arc::new(Flag(AtomicBool::new(false)));
        let b = Arc::new(Flag(AtomicBool::new(false)));
        registry.register(Arc::downgrade(&a) as Weak<dyn StoppableView>);
        registry.register(Arc::downgrade(&b) as Weak<dyn StoppableView>);
        registry.stop_all();
        assert!(a.0.load(Ordering::SeqCst));
        assert!(b.0.load(Ordering::SeqCst));
    }

    #[test]
    fn dropped_view_is_skipped_not_panicked() {
        let registry = ViewRegistry::new();
        {
            let a = Arc::new(Flag(AtomicBool::new(false)));
            registry.register(Arc::downgrade(&a) as Weak<dyn StoppableView>);
        }
        registry.stop_all();
    }
}
