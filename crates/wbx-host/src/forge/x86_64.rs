//! x86-64 System V code emission.
//!
//! Integer arguments travel in rdi, rsi, rdx, rcx, r8, r9. A trampoline for a
//! caller passing `arity` arguments loads the bound value into register
//! `arity`, so the target sees the caller's arguments untouched followed by
//! one extra.

use super::TrampolineKind;

/// General purpose register encoding.
#[derive(Debug, Clone, Copy)]
struct Gpr {
    /// Low three bits of the register number
    code: u8,
    /// r8-r15 need REX.B
    extended: bool,
}

const RAX: Gpr = Gpr { code: 0, extended: false };
const RDI: Gpr = Gpr { code: 7, extended: false };
const RSI: Gpr = Gpr { code: 6, extended: false };
const RDX: Gpr = Gpr { code: 2, extended: false };
const RCX: Gpr = Gpr { code: 1, extended: false };
const R8: Gpr = Gpr { code: 0, extended: true };
const R9: Gpr = Gpr { code: 1, extended: true };

/// Integer argument registers in ABI order.
const ARG_REGS: [Gpr; 6] = [RDI, RSI, RDX, RCX, R8, R9];

const REX_W: u8 = 0x48;
const REX_B: u8 = 0x41;

/// Longest sequence `emit` produces.
pub const MAX_CODE_LEN: usize = 27;

/// Emit the forwarding sequence. `arity` must be at most 5.
pub fn emit(target: u64, bound: u64, arity: usize, kind: TrampolineKind) -> Vec<u8> {
    debug_assert!(arity < ARG_REGS.len());
    let reg = ARG_REGS[arity];
    let mut code = Vec::with_capacity(MAX_CODE_LEN);

    match kind {
        TrampolineKind::ReturnPreserving => {
            // the caller doesn't know about the extra argument, so the
            // register is saved around the call; the push also keeps the
            // stack 16-byte aligned at the target's entry
            push(&mut code, reg);
            mov_imm64(&mut code, reg, bound);
            mov_imm64(&mut code, RAX, target);
            code.extend_from_slice(&[0xFF, 0xD0]); // call rax
            pop(&mut code, reg);
            code.push(0xC3); // ret
        }
        TrampolineKind::TailRedirect => {
            mov_imm64(&mut code, reg, bound);
            mov_imm64(&mut code, RAX, target);
            code.extend_from_slice(&[0xFF, 0xE0]); // jmp rax
        }
    }

    code
}

fn push(code: &mut Vec<u8>, reg: Gpr) {
    if reg.extended {
        code.push(REX_B);
    }
    code.push(0x50 + reg.code);
}

fn pop(code: &mut Vec<u8>, reg: Gpr) {
    if reg.extended {
        code.push(REX_B);
    }
    code.push(0x58 + reg.code);
}

// movabs reg, imm64
fn mov_imm64(code: &mut Vec<u8>, reg: Gpr, imm: u64) {
    code.push(if reg.extended { REX_W | 0x01 } else { REX_W });
    code.push(0xB8 + reg.code);
    code.extend_from_slice(&imm.to_le_bytes());
}
