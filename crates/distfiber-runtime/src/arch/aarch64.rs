//! aarch64 context switching (AAPCS64)

use super::EntryFn;
use std::arch::naked_asm;

/// Saved callee-saved state
///
/// Layout (offsets are used by the assembly below):
/// ```text
/// 0x00..0x50: x19-x28   0x50: x29 (fp)   0x58: x30 (lr)   0x60: sp
/// 0x68..0xA8: d8-d15
/// ```
#[repr(C)]
#[derive(Debug, Default)]
pub struct Context {
    pub x19_x28: [u64; 10],
    pub fp: u64,
    pub lr: u64,
    pub sp: u64,
    pub d8_d15: [u64; 8],
}

/// Prepare `ctx` so that switching to it runs `entry(arg)` on the stack
/// ending at `stack_top`.
///
/// # Safety
///
/// `ctx` must be valid for writes; `stack_top` must be the exclusive upper
/// end of a writable stack that outlives the context.
#[inline]
pub unsafe fn init_context(ctx: *mut Context, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    let ctx = &mut *ctx;
    *ctx = Context::default();
    ctx.x19_x28[0] = entry as *const () as usize as u64;
    ctx.x19_x28[1] = arg as u64;
    ctx.lr = fiber_trampoline as *const () as usize as u64;
    ctx.sp = ((stack_top as usize) & !0xF) as u64;
}

#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        "brk #0x1",
    );
}

/// Save the running context into `old` and resume `new`.
///
/// # Safety
///
/// Both pointers must reference valid contexts; `new` must hold a context
/// produced by [`init_context`] or a previous `swap_context`, and must not
/// be running on any thread.
#[unsafe(naked)]
pub unsafe extern "C" fn swap_context(_old: *mut Context, _new: *const Context) {
    naked_asm!(
        // Save into old (x0)
        "stp x19, x20, [x0, #0x00]",
        "stp x21, x22, [x0, #0x10]",
        "stp x23, x24, [x0, #0x20]",
        "stp x25, x26, [x0, #0x30]",
        "stp x27, x28, [x0, #0x40]",
        "stp x29, x30, [x0, #0x50]",
        "mov x9, sp",
        "str x9, [x0, #0x60]",
        "stp d8, d9, [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        // Load from new (x1)
        "ldp x19, x20, [x1, #0x00]",
        "ldp x21, x22, [x1, #0x10]",
        "ldp x23, x24, [x1, #0x20]",
        "ldp x25, x26, [x1, #0x30]",
        "ldp x27, x28, [x1, #0x40]",
        "ldp x29, x30, [x1, #0x50]",
        "ldr x9, [x1, #0x60]",
        "mov sp, x9",
        "ldp d8, d9, [x1, #0x68]",
        "ldp d10, d11, [x1, #0x78]",
        "ldp d12, d13, [x1, #0x88]",
        "ldp d14, d15, [x1, #0x98]",
        "ret",
    );
}
