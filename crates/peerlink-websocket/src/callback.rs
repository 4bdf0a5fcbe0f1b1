//! Swappable event callback slot

use std::sync::RwLock;

type Handler<A> = Box<dyn Fn(A) + Send + Sync>;

/// Holder for a single user event callback.
///
/// Teardown resets every slot before disposing the transports, so a late
/// transport task finds the slot empty instead of a stale handler.
pub(crate) struct Callback<A> {
    handler: RwLock<Option<Handler<A>>>,
}

impl<A> Callback<A> {
    pub(crate) fn new() -> Self {
        Self {
            handler: RwLock::new(None),
        }
    }

    pub(crate) fn set(&self, handler: impl Fn(A) + Send + Sync + 'static) {
        *self.handler.write().unwrap() = Some(Box::new(handler));
    }

    pub(crate) fn reset(&self) {
        *self.handler.write().unwrap() = None;
    }

    pub(crate) fn is_set(&self) -> bool {
        self.handler.read().unwrap().is_some()
    }

    pub(crate) fn call(&self, argument: A) {
        if let Some(handler) = self.handler.read().unwrap().as_ref() {
            handler(argument);
        }
    }
}

impl<A> std::fmt::Debug for Callback<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callback")
            .field("set", &self.is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn call_is_a_no_op_until_set() {
        let callback: Callback<usize> = Callback::new();
        callback.call(1);

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        callback.set(move |n| {
            counter.fetch_add(n, Ordering::SeqCst);
        });
        callback.call(2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reset_silences_the_slot() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        let callback: Callback<()> = Callback::new();
        callback.set(move |()| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        callback.call(());
        callback.reset();
        callback.call(());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
