// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to the platform the kernel runs on.
//!
//! The dispatch core consumes three things from its environment: a way to
//! make its state changes atomic with respect to producers and consumers, a
//! per-task binary-counted semaphore with millisecond timeout, and a
//! monotonic millisecond clock. On hosted platforms the first is the mutex
//! wrapped around the kernel core; this module supplies the other two.

cfg_if::cfg_if! {
    if #[cfg(any(unix, windows))] {
        mod hosted;
        pub use hosted::*;
    } else {
        compile_error!("no arch support for this platform");
    }
}
