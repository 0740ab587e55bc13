//! Counting readiness barrier.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Side effect run on every lock or unlock edge.
pub type GateHook = Arc<dyn Fn(&Gate) + Send + Sync>;

static INSTANCES: AtomicUsize = AtomicUsize::new(0);

struct Shared {
    count: AtomicUsize,
    on_lock: Option<GateHook>,
    on_unlock: Option<GateHook>,
}

/// A gate is closed while its lock count is positive.
///
/// There is no "became open" event: `on_unlock` runs for every `unlock()` call,
/// including ones that hit the floor, so hooks must check [`Gate::is_open`].
#[derive(Clone)]
pub struct Gate {
    shared: Arc<Shared>,
}

impl Gate {
    #[must_use]
    pub fn new(on_lock: Option<GateHook>, on_unlock: Option<GateHook>) -> Self {
        INSTANCES.fetch_add(1, Ordering::Relaxed);
        Self {
            shared: Arc::new(Shared {
                count: AtomicUsize::new(0),
                on_lock,
                on_unlock,
            }),
        }
    }

    /// A gate without hooks.
    #[must_use]
    pub fn plain() -> Self {
        Self::new(None, None)
    }

    pub fn lock(&self) -> &Self {
        self.shared.count.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = &self.shared.on_lock {
            hook(self);
        }
        self
    }

    /// Decrement, clamped at zero.
    pub fn unlock(&self) -> &Self {
        // Saturating: the closure never returns None.
        let _ = self
            .shared
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(1))
            });
        if let Some(hook) = &self.shared.on_unlock {
            hook(self);
        }
        self
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.count() == 0
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.shared.count.load(Ordering::SeqCst)
    }

    /// Gates created in this process so far.
    #[must_use]
    pub fn instances() -> usize {
        INSTANCES.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gate")
            .field("count", &self.count())
            .finish_non_exhaustive()
    }
}
