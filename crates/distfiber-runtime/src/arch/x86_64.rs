//! x86_64 context switching (System V AMD64)

use super::EntryFn;
use std::arch::naked_asm;

/// Default MXCSR (all exceptions masked, round-to-nearest)
const MXCSR_DEFAULT: u64 = 0x1F80;

/// Default x87 control word
const FPU_CW_DEFAULT: u64 = 0x037F;

/// Saved callee-saved state
///
/// Layout (offsets are used by the assembly below):
/// ```text
/// 0x00: rsp   0x08: rip   0x10: rbx   0x18: rbp
/// 0x20: r12   0x28: r13   0x30: r14   0x38: r15
/// 0x40: mxcsr (u32)       0x44: x87 control word (u16)
/// ```
#[repr(C)]
#[derive(Debug, Default)]
pub struct Context {
    pub rsp: u64,
    pub rip: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub fpu: u64,
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
    // The trampoline is entered by `jmp`, so rsp must already be 16-byte
    // aligned for its `call`
    let sp = (stack_top as usize) & !0xF;

    let ctx = &mut *ctx;
    ctx.rsp = sp as u64;
    ctx.rip = fiber_trampoline as *const () as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry as *const () as usize as u64;
    ctx.r13 = arg as u64;
    ctx.r14 = 0;
    ctx.r15 = 0;
    ctx.fpu = MXCSR_DEFAULT | (FPU_CW_DEFAULT << 32);
}

#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
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
        // Save into old (rdi)
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        "stmxcsr [rdi + 0x40]",
        "fnstcw [rdi + 0x44]",
        // Load from new (rsi)
        "mov rsp, [rsi + 0x00]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "ldmxcsr [rsi + 0x40]",
        "fldcw [rsi + 0x44]",
        "jmp qword ptr [rsi + 0x08]",
        // Resume point of a saved context
        "2:",
        "ret",
    );
}
