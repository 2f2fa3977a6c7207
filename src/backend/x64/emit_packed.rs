//! Lowerings for the packed (SIMD-in-GPR) DSP opcodes.
//!
//! Wrapping add/sub use SWAR or a round trip through XMM registers; the
//! halving family uses the identity `x + y == ((x & y) << 1) + (x ^ y)`, so
//! `(x + y) / 2 == (x & y) + ((x ^ y) >> 1)` can be computed without lane
//! overflow. Attached GE pseudo-ops compute per-lane greater-or-equal bits:
//! a nibble for byte lanes, a duplicated pair for word lanes.

use crate::backend::x64::assembler::{Reg, XMM0};
use crate::backend::x64::emit_context::EmitContext;
use crate::backend::x64::emit_data_processing::take_pseudo_op;
use crate::backend::x64::reg_alloc::RegAlloc;
use crate::ir::block::Block;
use crate::ir::inst::Inst;
use crate::ir::opcode::Opcode;
use crate::ir::value::InstRef;

/// Pack the top bit of each byte into the low nibble:
/// `a-------b-------c-------d-------` becomes `0...0abcd`.
fn extract_most_significant_bit_from_packed_bytes(
    ctx: &EmitContext,
    ra: &mut RegAlloc,
    value: Reg,
) {
    if ctx.cpu.bmi2 {
        let tmp = ra.scratch_gpr().cvt32();
        ra.asm.mov(tmp, 0x8080_8080u32 as i32);
        ra.asm.pext(value, value, tmp);
    } else {
        ra.asm.and_(value, 0x8080_8080u32 as i32);
        ra.asm.imul3(value, value, 0x0020_4081);
        ra.asm.shr(value, 28);
    }
}

/// Pack the top bit of each word, duplicated, into the low nibble:
/// `a---------------b---------------` becomes `0...0aabb`.
fn extract_and_duplicate_most_significant_bit_from_packed_words(ra: &mut RegAlloc, value: Reg) {
    ra.asm.and_(value, 0x8000_8000u32 as i32);
    ra.asm.shr(value, 1);
    ra.asm.imul3(value, value, 0xC003);
    ra.asm.shr(value, 28);
}

// ---------------------------------------------------------------------------
// Wrapping packed add/sub
// ---------------------------------------------------------------------------

pub fn emit_packed_add_u8(ctx: &EmitContext, ra: &mut RegAlloc, block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let ge_inst = take_pseudo_op(block, ra, inst_ref, Opcode::GetGEFromOp);

    let mut args = ra.get_argument_info(inst);
    let reg_a = ra.use_scratch_gpr(&mut args[0]).cvt32();
    let reg_b = ra.use_scratch_gpr(&mut args[1]).cvt32();
    let result = ra.def_gpr(inst_ref).cvt32();

    let reg_ge = ge_inst.map(|ge| {
        let reg_ge = ra.def_gpr(ge).cvt32();
        ra.asm.mov(reg_ge, reg_a);
        ra.asm.and_(reg_ge, reg_b);
        reg_ge
    });
    let tmp = ge_inst.map(|_| ra.scratch_gpr().cvt32());

    // SWAR: add the low 7 bits of each lane, then fold the top bits back in.
    ra.asm.mov(result, reg_a);
    ra.asm.xor_(result, reg_b);
    ra.asm.and_(result, 0x8080_8080u32 as i32);
    ra.asm.and_(reg_a, 0x7F7F_7F7Fi32);
    ra.asm.and_(reg_b, 0x7F7F_7F7Fi32);
    ra.asm.add(reg_a, reg_b);
    if let (Some(reg_ge), Some(tmp)) = (reg_ge, tmp) {
        ra.asm.mov(tmp, result);
        ra.asm.and_(tmp, reg_a);
        ra.asm.or_(reg_ge, tmp);
    }
    ra.asm.xor_(result, reg_a);
    if let Some(reg_ge) = reg_ge {
        extract_most_significant_bit_from_packed_bytes(ctx, ra, reg_ge);
    }
}

pub fn emit_packed_add_s8(ctx: &EmitContext, ra: &mut RegAlloc, block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let ge_inst = take_pseudo_op(block, ra, inst_ref, Opcode::GetGEFromOp);

    let mut args = ra.get_argument_info(inst);
    let reg_a = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();
    let reg_b = ra.use_gpr(&mut args[1]).cvt32();
    let reg_ge = ge_inst.map(|ge| ra.def_gpr(ge).cvt32());

    let xmm_a = ra.scratch_xmm();
    let xmm_b = ra.scratch_xmm();

    ra.asm.movd(xmm_a, reg_a);
    ra.asm.movd(xmm_b, reg_b);
    if let Some(reg_ge) = reg_ge {
        // GE is set when the true sum fits, i.e. the saturated sum is
        // non-negative.
        let saturated_sum = ra.scratch_xmm();
        ra.asm.movdqa(saturated_sum, xmm_a);
        ra.asm.paddsb(saturated_sum, xmm_b);
        ra.asm.movd(reg_ge, saturated_sum);
    }
    ra.asm.paddb(xmm_a, xmm_b);
    ra.asm.movd(reg_a, xmm_a);
    if let Some(reg_ge) = reg_ge {
        ra.asm.not_(reg_ge);
        extract_most_significant_bit_from_packed_bytes(ctx, ra, reg_ge);
    }
}

pub fn emit_packed_add_u16(_ctx: &EmitContext, ra: &mut RegAlloc, block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let ge_inst = take_pseudo_op(block, ra, inst_ref, Opcode::GetGEFromOp);

    let mut args = ra.get_argument_info(inst);
    let reg_a = ra.use_scratch_gpr(&mut args[0]).cvt32();
    let reg_b = ra.use_scratch_gpr(&mut args[1]).cvt32();
    let result = ra.def_gpr(inst_ref).cvt32();

    let reg_ge = ge_inst.map(|ge| {
        let reg_ge = ra.def_gpr(ge).cvt32();
        ra.asm.mov(reg_ge, reg_a);
        ra.asm.and_(reg_ge, reg_b);
        reg_ge
    });
    let tmp = ge_inst.map(|_| ra.scratch_gpr().cvt32());

    ra.asm.mov(result, reg_a);
    ra.asm.xor_(result, reg_b);
    ra.asm.and_(result, 0x8000_8000u32 as i32);
    ra.asm.and_(reg_a, 0x7FFF_7FFFi32);
    ra.asm.and_(reg_b, 0x7FFF_7FFFi32);
    ra.asm.add(reg_a, reg_b);
    if let (Some(reg_ge), Some(tmp)) = (reg_ge, tmp) {
        ra.asm.mov(tmp, result);
        ra.asm.and_(tmp, reg_a);
        ra.asm.or_(reg_ge, tmp);
    }
    ra.asm.xor_(result, reg_a);
    if let Some(reg_ge) = reg_ge {
        extract_and_duplicate_most_significant_bit_from_packed_words(ra, reg_ge);
    }
}

pub fn emit_packed_add_s16(_ctx: &EmitContext, ra: &mut RegAlloc, block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let ge_inst = take_pseudo_op(block, ra, inst_ref, Opcode::GetGEFromOp);

    let mut args = ra.get_argument_info(inst);
    let reg_a = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();
    let reg_b = ra.use_gpr(&mut args[1]).cvt32();
    let reg_ge = ge_inst.map(|ge| ra.def_gpr(ge).cvt32());

    let xmm_a = ra.scratch_xmm();
    let xmm_b = ra.scratch_xmm();

    ra.asm.movd(xmm_a, reg_a);
    ra.asm.movd(xmm_b, reg_b);
    if let Some(reg_ge) = reg_ge {
        let saturated_sum = ra.scratch_xmm();
        ra.asm.movdqa(saturated_sum, xmm_a);
        ra.asm.paddsw(saturated_sum, xmm_b);
        ra.asm.movd(reg_ge, saturated_sum);
    }
    ra.asm.paddw(xmm_a, xmm_b);
    ra.asm.movd(reg_a, xmm_a);
    if let Some(reg_ge) = reg_ge {
        ra.asm.not_(reg_ge);
        extract_and_duplicate_most_significant_bit_from_packed_words(ra, reg_ge);
    }
}

pub fn emit_packed_sub_u8(ctx: &EmitContext, ra: &mut RegAlloc, block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let ge_inst = take_pseudo_op(block, ra, inst_ref, Opcode::GetGEFromOp);

    let mut args = ra.get_argument_info(inst);
    let reg_a = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();
    let reg_b = ra.use_gpr(&mut args[1]).cvt32();
    let reg_ge = ge_inst.map(|ge| ra.def_gpr(ge).cvt32());

    let xmm_a = ra.scratch_xmm();
    let xmm_b = ra.scratch_xmm();

    ra.asm.movd(xmm_a, reg_a);
    ra.asm.movd(xmm_b, reg_b);
    if let Some(reg_ge) = reg_ge {
        // a >= b per lane: max(a, b) == a.
        let xmm_ge = ra.scratch_xmm();
        ra.asm.movdqa(xmm_ge, xmm_a);
        ra.asm.pmaxub(xmm_ge, xmm_b);
        ra.asm.pcmpeqb(xmm_ge, xmm_a);
        ra.asm.movd(reg_ge, xmm_ge);
    }
    ra.asm.psubb(xmm_a, xmm_b);
    ra.asm.movd(reg_a, xmm_a);
    if let Some(reg_ge) = reg_ge {
        extract_most_significant_bit_from_packed_bytes(ctx, ra, reg_ge);
    }
}

pub fn emit_packed_sub_s8(ctx: &EmitContext, ra: &mut RegAlloc, block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let ge_inst = take_pseudo_op(block, ra, inst_ref, Opcode::GetGEFromOp);

    let mut args = ra.get_argument_info(inst);
    let reg_a = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();
    let reg_b = ra.use_gpr(&mut args[1]).cvt32();
    let reg_ge = ge_inst.map(|ge| ra.def_gpr(ge).cvt32());

    let xmm_a = ra.scratch_xmm();
    let xmm_b = ra.scratch_xmm();

    ra.asm.movd(xmm_b, reg_b);
    ra.asm.movd(xmm_a, reg_a);
    if let Some(reg_ge) = reg_ge {
        let xmm_ge = ra.scratch_xmm();
        ra.asm.movdqa(xmm_ge, xmm_a);
        ra.asm.psubsb(xmm_ge, xmm_b);
        ra.asm.movd(reg_ge, xmm_ge);
    }
    ra.asm.psubb(xmm_a, xmm_b);
    ra.asm.movd(reg_a, xmm_a);
    if let Some(reg_ge) = reg_ge {
        ra.asm.not_(reg_ge);
        extract_most_significant_bit_from_packed_bytes(ctx, ra, reg_ge);
    }
}

pub fn emit_packed_sub_u16(ctx: &EmitContext, ra: &mut RegAlloc, block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let ge_inst = take_pseudo_op(block, ra, inst_ref, Opcode::GetGEFromOp);

    let mut args = ra.get_argument_info(inst);
    let reg_a = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();
    let reg_b = ra.use_gpr(&mut args[1]).cvt32();
    let reg_ge = ge_inst.map(|ge| ra.def_gpr(ge).cvt32());

    let xmm_a = ra.scratch_xmm();
    let xmm_b = ra.scratch_xmm();

    ra.asm.movd(xmm_a, reg_a);
    ra.asm.movd(xmm_b, reg_b);
    if let Some(reg_ge) = reg_ge {
        let xmm_ge = ra.scratch_xmm();
        if ctx.cpu.sse41 {
            ra.asm.movdqa(xmm_ge, xmm_a);
            ra.asm.pmaxuw(xmm_ge, xmm_b);
            ra.asm.pcmpeqw(xmm_ge, xmm_a);
        } else {
            // b <=u a per lane exactly when the saturating b - a is zero.
            ra.asm.movdqa(xmm_ge, xmm_b);
            ra.asm.psubusw(xmm_ge, xmm_a);
            ra.asm.pxor(XMM0, XMM0);
            ra.asm.pcmpeqw(xmm_ge, XMM0);
        }
        ra.asm.movd(reg_ge, xmm_ge);
    }
    ra.asm.psubw(xmm_a, xmm_b);
    ra.asm.movd(reg_a, xmm_a);
    if let Some(reg_ge) = reg_ge {
        extract_and_duplicate_most_significant_bit_from_packed_words(ra, reg_ge);
    }
}

pub fn emit_packed_sub_s16(_ctx: &EmitContext, ra: &mut RegAlloc, block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let ge_inst = take_pseudo_op(block, ra, inst_ref, Opcode::GetGEFromOp);

    let mut args = ra.get_argument_info(inst);
    let reg_a = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();
    let reg_b = ra.use_gpr(&mut args[1]).cvt32();
    let reg_ge = ge_inst.map(|ge| ra.def_gpr(ge).cvt32());

    let xmm_a = ra.scratch_xmm();
    let xmm_b = ra.scratch_xmm();

    ra.asm.movd(xmm_b, reg_b);
    ra.asm.movd(xmm_a, reg_a);
    if let Some(reg_ge) = reg_ge {
        let xmm_ge = ra.scratch_xmm();
        ra.asm.movdqa(xmm_ge, xmm_a);
        ra.asm.psubsw(xmm_ge, xmm_b);
        ra.asm.movd(reg_ge, xmm_ge);
    }
    ra.asm.psubw(xmm_a, xmm_b);
    ra.asm.movd(reg_a, xmm_a);
    if let Some(reg_ge) = reg_ge {
        ra.asm.not_(reg_ge);
        extract_and_duplicate_most_significant_bit_from_packed_words(ra, reg_ge);
    }
}

// ---------------------------------------------------------------------------
// Halving add/sub
// ---------------------------------------------------------------------------

pub fn emit_packed_halving_add_u8(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);

    if ctx.cpu.ssse3 {
        // Widen each byte to a word, add, halve, and shuffle back.
        let result = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();
        let arg = ra.use_gpr(&mut args[1]).cvt32();

        let xmm_a = ra.scratch_xmm();
        let xmm_b = ra.scratch_xmm();
        let xmm_mask = ra.scratch_xmm();
        let mask = ra.scratch_gpr();

        ra.asm.movd(xmm_a, result);
        ra.asm.movd(xmm_b, arg);

        ra.asm.mov(mask, 0x8003_8002_8001_8000u64 as i64);
        ra.asm.movq(xmm_mask, mask);
        ra.asm.pshufb(xmm_a, xmm_mask);
        ra.asm.pshufb(xmm_b, xmm_mask);

        ra.asm.paddw(xmm_a, xmm_b);
        ra.asm.psrlw(xmm_a, 1);

        ra.asm.mov(mask, 0x0604_0200i64);
        ra.asm.movq(xmm_mask, mask);
        ra.asm.pshufb(xmm_a, xmm_mask);

        ra.asm.movd(result, xmm_a);
        return;
    }

    let result = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();
    let reg_b = ra.use_gpr(&mut args[1]).cvt32();
    let xor_a_b = ra.scratch_gpr().cvt32();

    // (a & b) + ((a ^ b) >> 1), masking the shifted-out lane LSBs.
    ra.asm.mov(xor_a_b, result);
    ra.asm.and_(result, reg_b);
    ra.asm.xor_(xor_a_b, reg_b);
    ra.asm.shr(xor_a_b, 1);
    ra.asm.and_(xor_a_b, 0x7F7F_7F7Fi32);
    ra.asm.add(result, xor_a_b);
}

pub fn emit_packed_halving_add_u16(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();
    let reg_b = ra.use_gpr(&mut args[1]).cvt32();
    let xor_a_b = ra.scratch_gpr().cvt32();

    ra.asm.mov(xor_a_b, result);
    ra.asm.and_(result, reg_b);
    ra.asm.xor_(xor_a_b, reg_b);
    ra.asm.shr(xor_a_b, 1);
    ra.asm.and_(xor_a_b, 0x7FFF_7FFFi32);
    ra.asm.add(result, xor_a_b);
}

fn emit_packed_halving_add_signed(ra: &mut RegAlloc, inst_ref: InstRef, inst: &Inst, mask: u32, sign_mask: u32) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();
    let reg_b = ra.use_gpr(&mut args[1]).cvt32();
    let xor_a_b = ra.scratch_gpr().cvt32();
    let carry = ra.scratch_gpr().cvt32();

    // As for the unsigned case, plus an xor-fold of the per-lane sign bits
    // of (a ^ b) to sign-extend the halved value.
    ra.asm.mov(xor_a_b, result);
    ra.asm.and_(result, reg_b);
    ra.asm.xor_(xor_a_b, reg_b);
    ra.asm.mov(carry, xor_a_b);
    ra.asm.and_(carry, sign_mask as i32);
    ra.asm.shr(xor_a_b, 1);
    ra.asm.and_(xor_a_b, mask as i32);
    ra.asm.add(result, xor_a_b);
    ra.asm.xor_(result, carry);
}

pub fn emit_packed_halving_add_s8(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    emit_packed_halving_add_signed(ra, inst_ref, inst, 0x7F7F_7F7F, 0x8080_8080);
}

pub fn emit_packed_halving_add_s16(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    emit_packed_halving_add_signed(ra, inst_ref, inst, 0x7FFF_7FFF, 0x8000_8000);
}

pub fn emit_packed_halving_sub_u8(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let minuend = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();
    let subtrahend = ra.use_scratch_gpr(&mut args[1]).cvt32();

    // x - y == (x ^ y) - (((x ^ y) & y) << 1), so
    // (x - y) / 2 == ((x ^ y) >> 1) - ((x ^ y) & y).
    ra.asm.xor_(minuend, subtrahend);
    ra.asm.and_(subtrahend, minuend);
    ra.asm.shr(minuend, 1);

    // Partitioned subtraction: seed a borrow bit at the top of each lane,
    // then invert it to recover the true per-lane borrow-out.
    ra.asm.or_(minuend, 0x8080_8080u32 as i32);
    ra.asm.sub(minuend, subtrahend);
    ra.asm.xor_(minuend, 0x8080_8080u32 as i32);
}

pub fn emit_packed_halving_sub_s8(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let minuend = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();
    let subtrahend = ra.use_scratch_gpr(&mut args[1]).cvt32();
    let carry = ra.scratch_gpr().cvt32();

    ra.asm.xor_(minuend, subtrahend);
    ra.asm.and_(subtrahend, minuend);
    ra.asm.mov(carry, minuend);
    ra.asm.and_(carry, 0x8080_8080u32 as i32);
    ra.asm.shr(minuend, 1);

    ra.asm.or_(minuend, 0x8080_8080u32 as i32);
    ra.asm.sub(minuend, subtrahend);
    ra.asm.xor_(minuend, 0x8080_8080u32 as i32);
    // Sign-extend each halved lane.
    ra.asm.xor_(minuend, carry);
}

pub fn emit_packed_halving_sub_u16(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let minuend = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();
    let subtrahend = ra.use_scratch_gpr(&mut args[1]).cvt32();

    ra.asm.xor_(minuend, subtrahend);
    ra.asm.and_(subtrahend, minuend);
    ra.asm.shr(minuend, 1);

    ra.asm.or_(minuend, 0x8000_8000u32 as i32);
    ra.asm.sub(minuend, subtrahend);
    ra.asm.xor_(minuend, 0x8000_8000u32 as i32);
}

pub fn emit_packed_halving_sub_s16(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let minuend = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();
    let subtrahend = ra.use_scratch_gpr(&mut args[1]).cvt32();
    let carry = ra.scratch_gpr().cvt32();

    ra.asm.xor_(minuend, subtrahend);
    ra.asm.and_(subtrahend, minuend);
    ra.asm.mov(carry, minuend);
    ra.asm.and_(carry, 0x8000_8000u32 as i32);
    ra.asm.shr(minuend, 1);

    ra.asm.or_(minuend, 0x8000_8000u32 as i32);
    ra.asm.sub(minuend, subtrahend);
    ra.asm.xor_(minuend, 0x8000_8000u32 as i32);
    ra.asm.xor_(minuend, carry);
}

fn emit_packed_halving_sub_add(ra: &mut RegAlloc, inst_ref: InstRef, inst: &Inst, signed: bool) {
    let mut args = ra.get_argument_info(inst);
    let asx = args[2].get_immediate_u1();
    ra.discard_use(&mut args[2]);

    let reg_a_hi = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();
    let reg_b_hi = ra.use_scratch_gpr(&mut args[1]).cvt32();
    let reg_a_lo = ra.scratch_gpr().cvt32();
    let reg_b_lo = ra.scratch_gpr().cvt32();

    if signed {
        ra.asm.movsx(reg_a_lo, reg_a_hi.cvt16());
        ra.asm.movsx(reg_b_lo, reg_b_hi.cvt16());
        ra.asm.sar(reg_a_hi, 16);
        ra.asm.sar(reg_b_hi, 16);
    } else {
        ra.asm.movzx(reg_a_lo, reg_a_hi.cvt16());
        ra.asm.movzx(reg_b_lo, reg_b_hi.cvt16());
        ra.asm.shr(reg_a_hi, 16);
        ra.asm.shr(reg_b_hi, 16);
    }

    if asx {
        // lo = (a.lo - b.hi) / 2, hi = (a.hi + b.lo) / 2.
        ra.asm.sub(reg_a_lo, reg_b_hi);
        ra.asm.shl(reg_a_lo, 15);
        ra.asm.add(reg_a_hi, reg_b_lo);
        ra.asm.shr(reg_a_hi, 1);
    } else {
        // lo = (a.lo + b.hi) / 2, hi = (a.hi - b.lo) / 2.
        ra.asm.add(reg_a_lo, reg_b_hi);
        ra.asm.shl(reg_a_lo, 15);
        ra.asm.sub(reg_a_hi, reg_b_lo);
        ra.asm.shr(reg_a_hi, 1);
    }

    // reg_a_lo<31:16> holds the low word, reg_a_hi<15:0> the high word.
    ra.asm.shld(reg_a_hi, reg_a_lo, 16);
}

pub fn emit_packed_halving_sub_add_u16(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    emit_packed_halving_sub_add(ra, inst_ref, inst, false);
}

pub fn emit_packed_halving_sub_add_s16(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    emit_packed_halving_sub_add(ra, inst_ref, inst, true);
}

// ---------------------------------------------------------------------------
// Saturating packed ops and PSADBW: thin shells over the host instruction
// with a GPR <-> XMM round trip.
// ---------------------------------------------------------------------------

fn emit_packed_operation(
    ra: &mut RegAlloc,
    inst_ref: InstRef,
    inst: &Inst,
    op: fn(&mut crate::backend::x64::assembler::CodeAssembler, Reg, Reg),
) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();
    let arg = ra.use_gpr(&mut args[1]).cvt32();

    let xmm_a = ra.scratch_xmm();
    let xmm_b = ra.scratch_xmm();

    ra.asm.movd(xmm_a, result);
    ra.asm.movd(xmm_b, arg);
    op(ra.asm, xmm_a, xmm_b);
    ra.asm.movd(result, xmm_a);
}

macro_rules! packed_shells {
    ($($fn_name:ident => $mnemonic:ident),* $(,)?) => {
        $(
            pub fn $fn_name(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
                emit_packed_operation(ra, inst_ref, inst, |asm, a, b| asm.$mnemonic(a, b));
            }
        )*
    };
}

packed_shells! {
    emit_packed_saturated_add_u8 => paddusb,
    emit_packed_saturated_add_s8 => paddsb,
    emit_packed_saturated_add_u16 => paddusw,
    emit_packed_saturated_add_s16 => paddsw,
    emit_packed_saturated_sub_u8 => psubusb,
    emit_packed_saturated_sub_s8 => psubsb,
    emit_packed_saturated_sub_u16 => psubusw,
    emit_packed_saturated_sub_s16 => psubsw,
    emit_packed_abs_diff_sum_s8 => psadbw,
}
