//! aarch64 context switching implementation
//!
//! Saves x19-x28, fp, lr, sp and the callee-saved low halves of v8-v15
//! per AAPCS64.

use std::arch::naked_asm;

/// Callee-saved register image. The assembly in [`context_switch`]
/// addresses these fields by byte offset.
#[repr(C)]
#[derive(Debug)]
pub struct Context {
    pub sp: u64,     // 0x00
    pub pc: u64,     // 0x08
    pub x: [u64; 12], // 0x10: x19-x28, x29 (fp), x30 (lr)
    pub d: [u64; 8],  // 0x70: d8-d15
}

impl Context {
    pub const fn new() -> Self {
        Context {
            sp: 0,
            pc: 0,
            x: [0; 12],
            d: [0; 8],
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
/// # Safety
///
/// `ctx` must point to valid Context memory.
/// `stack_top` must be the highest address of a live stack mapping.
#[inline]
pub unsafe fn init_context(ctx: *mut Context, stack_top: *mut u8, entry_fn: usize, entry_arg: usize) {
    // AAPCS64 requires sp to stay 16-byte aligned.
    let aligned_sp = (stack_top as usize) & !0xF;

    let ctx = &mut *ctx;
    ctx.sp = aligned_sp as u64;
    ctx.pc = fiber_entry_trampoline as usize as u64;
    ctx.x = [0; 12];
    ctx.d = [0; 8];
    ctx.x[0] = entry_fn as u64; // x19: entry function
    ctx.x[1] = entry_arg as u64; // x20: entry argument
}

/// Trampoline that calls the entry function with its argument.
///
/// The entry function must never return: a finished fiber switches away
/// through the runtime, so falling through here is a bug and traps.
#[unsafe(naked)]
pub unsafe extern "C" fn fiber_entry_trampoline() {
    naked_asm!("mov x0, x20", "blr x19", "brk #0",);
}

/// Perform a cooperative context switch
///
/// Saves callee-saved registers to `old_ctx` (x0) and loads from
/// `new_ctx` (x1).
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_old_ctx: *mut Context, _new_ctx: *const Context) {
    naked_asm!(
        // Save to old_ctx (x0)
        "mov x9, sp",
        "str x9, [x0, #0x00]",
        "adr x9, 1f",
        "str x9, [x0, #0x08]",
        "stp x19, x20, [x0, #0x10]",
        "stp x21, x22, [x0, #0x20]",
        "stp x23, x24, [x0, #0x30]",
        "stp x25, x26, [x0, #0x40]",
        "stp x27, x28, [x0, #0x50]",
        "stp x29, x30, [x0, #0x60]",
        "stp d8, d9, [x0, #0x70]",
        "stp d10, d11, [x0, #0x80]",
        "stp d12, d13, [x0, #0x90]",
        "stp d14, d15, [x0, #0xa0]",
        // Load from new_ctx (x1)
        "ldr x9, [x1, #0x00]",
        "mov sp, x9",
        "ldp x19, x20, [x1, #0x10]",
        "ldp x21, x22, [x1, #0x20]",
        "ldp x23, x24, [x1, #0x30]",
        "ldp x25, x26, [x1, #0x40]",
        "ldp x27, x28, [x1, #0x50]",
        "ldp x29, x30, [x1, #0x60]",
        "ldp d8, d9, [x1, #0x70]",
        "ldp d10, d11, [x1, #0x80]",
        "ldp d12, d13, [x1, #0x90]",
        "ldp d14, d15, [x1, #0xa0]",
        // Jump to new PC
        "ldr x9, [x1, #0x08]",
        "br x9",
        // Return point for the saved context
        "1:",
        "ret",
    );
}
