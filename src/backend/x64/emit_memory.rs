//! Lowerings for guest memory access.
//!
//! With a page table configured, loads and stores index it by
//! `vaddr >> 12`, null-check the page pointer and access
//! `page + (vaddr & 0xFFF)` directly; a null entry falls back to the
//! per-width thunk, which preserves live registers and calls the user
//! callback. Without a page table every access takes the thunk.

use crate::backend::x64::abi;
use crate::backend::x64::assembler::{
    byte_ptr, dword_ptr, qword_ptr, word_ptr, RegExp, EAX, RAX,
};
use crate::backend::x64::emit_context::EmitContext;
use crate::backend::x64::hostloc::HOST_RAX;
use crate::backend::x64::jit_state::{JitState, RESERVATION_GRANULE_MASK};
use crate::backend::x64::reg_alloc::RegAlloc;
use crate::config::PAGE_MASK;
use crate::ir::block::Block;
use crate::ir::inst::Inst;
use crate::ir::value::InstRef;

fn thunk_index(bit_size: usize) -> usize {
    match bit_size {
        8 => 0,
        16 => 1,
        32 => 2,
        64 => 3,
        _ => panic!("Invalid memory access size {}", bit_size),
    }
}

fn exclusive_state() -> crate::backend::x64::assembler::Address {
    byte_ptr(RegExp::from(crate::backend::x64::assembler::R15) + JitState::offset_of_exclusive_state() as i32)
}

fn exclusive_address() -> crate::backend::x64::assembler::Address {
    dword_ptr(RegExp::from(crate::backend::x64::assembler::R15) + JitState::offset_of_exclusive_address() as i32)
}

// ---------------------------------------------------------------------------
// Plain loads and stores
// ---------------------------------------------------------------------------

fn read_memory(ctx: &EmitContext, ra: &mut RegAlloc, inst_ref: InstRef, inst: &Inst, bit_size: usize) {
    let mut args = ra.get_argument_info(inst);
    let thunk = ctx.trampolines.read_memory[thunk_index(bit_size)];

    let Some(page_table) = ctx.config.page_table else {
        let [a0, ..] = &mut args;
        ra.host_call(Some(inst_ref), [Some(a0), None, None, None]);
        ra.asm.call_offset(thunk);
        return;
    };

    let result = ra.def_gpr_at(inst_ref, abi::ABI_RETURN);
    let vaddr = ra.use_scratch_at(&mut args[0], abi::ABI_PARAMS[0]).cvt32();
    let page_index = ra.scratch_gpr();
    let page_offset = ra.scratch_gpr();

    let abort = ra.asm.create_label();
    let end = ra.asm.create_label();

    // RAX doubles as the page-table walker and the result register.
    ra.asm.mov(RAX, page_table as i64);
    ra.asm.mov(page_index.cvt32(), vaddr);
    ra.asm.shr(page_index.cvt32(), 12);
    ra.asm.mov(RAX, qword_ptr(RegExp::from(RAX) + page_index * 8u8));
    ra.asm.test(RAX, RAX);
    ra.asm.jz(&abort);
    ra.asm.mov(page_offset.cvt32(), vaddr);
    ra.asm.and_(page_offset.cvt32(), PAGE_MASK as i32);
    match bit_size {
        8 => ra.asm.movzx(result, byte_ptr(RegExp::from(RAX) + page_offset * 1u8)),
        16 => ra.asm.movzx(result, word_ptr(RegExp::from(RAX) + page_offset * 1u8)),
        32 => ra.asm.mov(result.cvt32(), dword_ptr(RegExp::from(RAX) + page_offset * 1u8)),
        64 => ra.asm.mov(result, qword_ptr(RegExp::from(RAX) + page_offset * 1u8)),
        _ => unreachable!(),
    }
    ra.asm.jmp(&end);
    ra.asm.bind(&abort);
    ra.asm.call_offset(thunk);
    ra.asm.bind(&end);
}

fn write_memory(ctx: &EmitContext, ra: &mut RegAlloc, inst: &Inst, bit_size: usize) {
    let mut args = ra.get_argument_info(inst);
    let thunk = ctx.trampolines.write_memory[thunk_index(bit_size)];

    let Some(page_table) = ctx.config.page_table else {
        let [a0, a1, ..] = &mut args;
        ra.host_call(None, [Some(a0), Some(a1), None, None]);
        ra.asm.call_offset(thunk);
        return;
    };

    let _rax = ra.scratch_gpr_at(HOST_RAX);
    let vaddr = ra.use_scratch_at(&mut args[0], abi::ABI_PARAMS[0]).cvt32();
    let value = ra.use_scratch_at(&mut args[1], abi::ABI_PARAMS[1]);
    let page_index = ra.scratch_gpr();
    let page_offset = ra.scratch_gpr();

    let abort = ra.asm.create_label();
    let end = ra.asm.create_label();

    ra.asm.mov(RAX, page_table as i64);
    ra.asm.mov(page_index.cvt32(), vaddr);
    ra.asm.shr(page_index.cvt32(), 12);
    ra.asm.mov(RAX, qword_ptr(RegExp::from(RAX) + page_index * 8u8));
    ra.asm.test(RAX, RAX);
    ra.asm.jz(&abort);
    ra.asm.mov(page_offset.cvt32(), vaddr);
    ra.asm.and_(page_offset.cvt32(), PAGE_MASK as i32);
    match bit_size {
        8 => ra.asm.mov(byte_ptr(RegExp::from(RAX) + page_offset * 1u8), value.cvt8()),
        16 => ra.asm.mov(word_ptr(RegExp::from(RAX) + page_offset * 1u8), value.cvt16()),
        32 => ra.asm.mov(dword_ptr(RegExp::from(RAX) + page_offset * 1u8), value.cvt32()),
        64 => ra.asm.mov(qword_ptr(RegExp::from(RAX) + page_offset * 1u8), value),
        _ => unreachable!(),
    }
    ra.asm.jmp(&end);
    ra.asm.bind(&abort);
    ra.asm.call_offset(thunk);
    ra.asm.bind(&end);
}

pub fn emit_read_memory_8(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    read_memory(ctx, ra, inst_ref, inst, 8);
}

pub fn emit_read_memory_16(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    read_memory(ctx, ra, inst_ref, inst, 16);
}

pub fn emit_read_memory_32(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    read_memory(ctx, ra, inst_ref, inst, 32);
}

pub fn emit_read_memory_64(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    read_memory(ctx, ra, inst_ref, inst, 64);
}

pub fn emit_write_memory_8(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, _inst_ref: InstRef, inst: &Inst) {
    write_memory(ctx, ra, inst, 8);
}

pub fn emit_write_memory_16(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, _inst_ref: InstRef, inst: &Inst) {
    write_memory(ctx, ra, inst, 16);
}

pub fn emit_write_memory_32(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, _inst_ref: InstRef, inst: &Inst) {
    write_memory(ctx, ra, inst, 32);
}

pub fn emit_write_memory_64(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, _inst_ref: InstRef, inst: &Inst) {
    write_memory(ctx, ra, inst, 64);
}

// ---------------------------------------------------------------------------
// Exclusive access
// ---------------------------------------------------------------------------

pub fn emit_clear_exclusive(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, _inst_ref: InstRef, _inst: &Inst) {
    ra.asm.mov(exclusive_state(), 0i32);
}

pub fn emit_set_exclusive(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, _inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    assert!(args[1].is_immediate());
    ra.discard_use(&mut args[1]);
    let address = ra.use_gpr(&mut args[0]);

    ra.asm.mov(exclusive_state(), 1i32);
    ra.asm.mov(exclusive_address(), address.cvt32());
}

/// Conditional store: without an active reservation, or with a mismatched
/// tag, report `passed = 1` and skip the write. On a match, clear the
/// reservation, perform the user write, and report `passed = 0`.
fn exclusive_write(ctx: &EmitContext, ra: &mut RegAlloc, inst_ref: InstRef, inst: &Inst, bit_size: usize) {
    let mut args = ra.get_argument_info(inst);
    let thunk = ctx.trampolines.write_memory[thunk_index(bit_size)];

    let [a0, a1, ..] = &mut args;
    ra.host_call(None, [Some(a0), Some(a1), None, None]);
    let passed = ra.def_gpr(inst_ref).cvt32();

    let end = ra.asm.create_label();

    ra.asm.mov(passed, 1i32);
    ra.asm.cmp(exclusive_state(), 0i32);
    ra.asm.je(&end);
    // Compare the reservation tag under the granule mask.
    ra.asm.mov(EAX, abi::ABI_PARAMS[0].to_reg64().cvt32());
    ra.asm.xor_(EAX, exclusive_address());
    ra.asm.test(EAX, RESERVATION_GRANULE_MASK as i32);
    ra.asm.jne(&end);
    ra.asm.mov(exclusive_state(), 0i32);
    ra.asm.call_offset(thunk);
    ra.asm.xor_(passed, passed);
    ra.asm.bind(&end);
}

pub fn emit_exclusive_write_memory_8(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    exclusive_write(ctx, ra, inst_ref, inst, 8);
}

pub fn emit_exclusive_write_memory_16(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    exclusive_write(ctx, ra, inst_ref, inst, 16);
}

pub fn emit_exclusive_write_memory_32(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    exclusive_write(ctx, ra, inst_ref, inst, 32);
}

/// The 64-bit variant takes the value as two 32-bit halves and merges them
/// before the callback.
pub fn emit_exclusive_write_memory_64(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let thunk = ctx.trampolines.write_memory[thunk_index(64)];

    let [a0, a1, a2, ..] = &mut args;
    ra.host_call(None, [Some(a0), Some(a1), None, None]);
    let passed = ra.def_gpr(inst_ref).cvt32();
    let value_hi = ra.use_scratch_gpr(a2);
    let value_lo = abi::ABI_PARAMS[1].to_reg64();

    let end = ra.asm.create_label();

    ra.asm.mov(passed, 1i32);
    ra.asm.cmp(exclusive_state(), 0i32);
    ra.asm.je(&end);
    ra.asm.mov(EAX, abi::ABI_PARAMS[0].to_reg64().cvt32());
    ra.asm.xor_(EAX, exclusive_address());
    ra.asm.test(EAX, RESERVATION_GRANULE_MASK as i32);
    ra.asm.jne(&end);
    ra.asm.mov(exclusive_state(), 0i32);
    ra.asm.mov(value_lo.cvt32(), value_lo.cvt32());
    ra.asm.shl(value_hi, 32);
    ra.asm.or_(value_lo, value_hi);
    ra.asm.call_offset(thunk);
    ra.asm.xor_(passed, passed);
    ra.asm.bind(&end);
}
