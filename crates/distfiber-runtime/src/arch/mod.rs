//! Architecture-specific context switching
//!
//! The only primitive the rest of the runtime relies on is
//! [`swap_context`]: save the callee-saved registers and stack pointer of the
//! running code into `old`, load `new`, and continue wherever `new` was
//! saved. A fresh context prepared by [`init_context`] starts in
//! `entry(arg)` on the given stack; `entry` must never return.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use self::x86_64::{Context, init_context, swap_context};
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use self::aarch64::{Context, init_context, swap_context};
    } else {
        compile_error!("distfiber supports x86_64 and aarch64 only");
    }
}

/// Entry point of a fresh context
pub type EntryFn = extern "C" fn(usize) -> !;
