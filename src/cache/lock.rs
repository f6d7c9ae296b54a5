use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::warn;

/// Acquire a mutex, recovering the guard if a previous holder panicked.
///
/// Cache state stays usable after a panic in a removal callback or loader;
/// the worst outcome is a stale entry, which the next touch or expiry drops.
pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    lock.lock()
        .unwrap_or_else(|poisoned| recover(poisoned, target, op))
}

fn recover<G>(poisoned: PoisonError<G>, target: &'static str, op: &'static str) -> G {
    warn!(
        op,
        target_module = target,
        lock_kind = "mutex.lock",
        result = "poisoned_recovered",
        hint = "entries may be stale after panic in another thread",
        "Recovered from poisoned cache lock"
    );
    poisoned.into_inner()
}
