use std::error::Error;
use std::sync::{Mutex, MutexGuard};

pub type DynResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// Lock a mutex, carrying on with the inner value if a panicking
/// holder poisoned it. Timer callbacks are run behind catch_unwind so
/// a poisoned lock must not take the rest of the tree down with it.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
