use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the data from a poisoned lock.
///
/// All state guarded this way is bookkeeping which is consistent after every individual
/// mutation, so a panic in another holder never leaves it half-updated.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
