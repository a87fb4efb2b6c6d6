//! x86_64 context switching implementation
//!
//! Uses inline assembly for context switch.
//! Now stable in Rust 1.88+

use std::arch::naked_asm;

/// Callee-saved register set per the System V AMD64 ABI, plus the saved
/// stack and instruction pointers.
///
/// Field order is load-bearing: the assembly in [`context_switch`] addresses
/// these fields by byte offset.
#[repr(C)]
#[derive(Debug)]
pub struct Context {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl Context {
    pub const fn new() -> Self {
        Context {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialize a fresh fiber context
///
/// Sets up the register image so that the first switch to this context
/// begins execution in `entry_fn(entry_arg)` via the trampoline.
///
/// # Safety
///
/// `ctx` must point to valid Context memory.
/// `stack_top` must be the highest address of a live stack mapping.
#[inline]
pub unsafe fn init_context(ctx: *mut Context, stack_top: *mut u8, entry_fn: usize, entry_arg: usize) {
    let sp = stack_top as usize;

    // The trampoline is jumped to on a 16-aligned rsp; its `call`
    // pushes the return address, so the entry function observes the
    // usual rsp % 16 == 8 of a freshly called function.
    let aligned_sp = sp & !0xF;

    let ctx = &mut *ctx;
    ctx.rsp = aligned_sp as u64;
    ctx.rip = fiber_entry_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry_fn as u64; // entry function
    ctx.r13 = entry_arg as u64; // entry argument
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// Trampoline that calls the entry function with its argument.
///
/// The entry function must never return: a finished fiber switches away
/// through the runtime, so falling through here is a bug and traps.
#[unsafe(naked)]
pub unsafe extern "C" fn fiber_entry_trampoline() {
    naked_asm!("mov rdi, r13", "call r12", "ud2",);
}

/// Perform a cooperative context switch
///
/// Saves callee-saved registers to `old_ctx` and loads from `new_ctx`.
/// Returns (into the saved context) when something later switches back.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old_ctx: *mut Context, _new_ctx: *const Context) {
    naked_asm!(
        // Save callee-saved registers to old_ctx (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from new_ctx (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to new RIP
        "jmp rax",
        // Return point for the saved context
        "1:",
        "ret",
    );
}
