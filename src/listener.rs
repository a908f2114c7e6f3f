//! Listener handles and their lifetimes.
//!
//! A listener owns the callback it registered; the upstream edge only holds
//! a weak reference to it, so revoking the callback is enough to turn any
//! firing already queued against it into a no-op. Strong listeners park a
//! clone of their handle in a process-wide keep-alive set and stay
//! registered until [`unlisten`]; weak listeners are kept alive by the
//! caller alone and revoke themselves when the last handle is dropped.
//!
//! [`unlisten`]: Listener::unlisten

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;

lazy_static! {
    /// Keep-alive set for strong listeners.
    static ref KEEP_ALIVE: Mutex<HashMap<u64, Listener>> = Mutex::new(HashMap::new());
}

static NEXT_KEEP_ALIVE_KEY: AtomicU64 = AtomicU64::new(0);

type Revoke = Box<dyn FnOnce() + Send>;

struct ListenerData {
    revoke: Mutex<Option<Revoke>>,
    keep_alive_key: Mutex<Option<u64>>,
}

impl Drop for ListenerData {
    fn drop(&mut self) {
        eprintln!("DBG ListenerData::drop enter thread={:?}", std::thread::current().id());
        // Last handle gone without an explicit unlisten: revoke now.
        if let Some(revoke) = self.revoke.get_mut().unwrap().take() {
            eprintln!("DBG ListenerData::drop calling revoke");
            revoke();
            eprintln!("DBG ListenerData::drop revoke returned");
        }
    }
}

/// A handle binding a callback to a stream.
///
/// Cloning shares the handle. Dropping every clone of a weak listener
/// deregisters the callback; a strong listener survives until
/// [`Listener::unlisten`].
pub struct Listener {
    data: Arc<ListenerData>,
}

impl Clone for Listener {
    fn clone(&self) -> Listener {
        Listener {
            data: self.data.clone(),
        }
    }
}

impl Listener {
    /// Wrap a revocation closure. The closure owns the registered callback
    /// and everything needed to unlink its edge.
    pub(crate) fn new(revoke: Revoke) -> Listener {
        Listener {
            data: Arc::new(ListenerData {
                revoke: Mutex::new(Some(revoke)),
                keep_alive_key: Mutex::new(None),
            }),
        }
    }

    /// Park a clone of this handle in the process-wide keep-alive set, so
    /// the callback outlives the caller's copy of the handle.
    pub(crate) fn keep_alive(self) -> Listener {
        let key = NEXT_KEEP_ALIVE_KEY.fetch_add(1, Ordering::Relaxed);
        *self.data.keep_alive_key.lock().unwrap() = Some(key);
        KEEP_ALIVE.lock().unwrap().insert(key, self.clone());
        self
    }

    /// Deregister the callback.
    ///
    /// Idempotent and safe to call from any thread. A firing already
    /// queued for this listener in the current transaction is dropped at
    /// dispatch time; no invocation happens after `unlisten` returns.
    pub fn unlisten(&self) {
        let revoke = self.data.revoke.lock().unwrap().take();
        if let Some(revoke) = revoke {
            revoke();
        }
        let key = self.data.keep_alive_key.lock().unwrap().take();
        if let Some(key) = key {
            KEEP_ALIVE.lock().unwrap().remove(&key);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unlisten_is_idempotent() {
        let count = Arc::new(Mutex::new(0));
        let count2 = count.clone();
        let listener = Listener::new(Box::new(move || *count2.lock().unwrap() += 1));
        listener.unlisten();
        listener.unlisten();
        listener.unlisten();
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn dropping_all_handles_revokes() {
        let count = Arc::new(Mutex::new(0));
        let count2 = count.clone();
        let listener = Listener::new(Box::new(move || *count2.lock().unwrap() += 1));
        let clone = listener.clone();
        drop(listener);
        assert_eq!(*count.lock().unwrap(), 0);
        drop(clone);
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn kept_alive_listener_survives_drop() {
        let count = Arc::new(Mutex::new(0));
        let count2 = count.clone();
        let listener =
            Listener::new(Box::new(move || *count2.lock().unwrap() += 1)).keep_alive();
        let probe = listener.clone();
        drop(listener);
        assert_eq!(*count.lock().unwrap(), 0);
        probe.unlisten();
        assert_eq!(*count.lock().unwrap(), 1);
        // A second unlisten after removal from the set is still a no-op.
        probe.unlisten();
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
