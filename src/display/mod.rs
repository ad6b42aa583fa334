//! Window pinning, screen-lock prevention and display hot-plug watch.
//!
//! All three are best-effort: an OS call that fails is reported to the caller
//! and audited, and never ends the session.

mod monitors;
mod power;
mod window;

pub use monitors::DisplayWatcher;
pub use power::ScreenLockGuard;
pub use window::WindowGuard;

use std::sync::{Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
