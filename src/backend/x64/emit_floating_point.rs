//! Lowerings for scalar floating-point opcodes.
//!
//! Every arithmetic lowering honours the block's sticky FPSCR modes:
//! flush-to-zero classifies denormal inputs and outputs (recording IDC/UFC),
//! and default-NaN replaces any NaN result with the canonical quiet NaN.
//! Conversions to integer saturate to the ARM range instead of the host's
//! indefinite-integer sentinel.

use crate::backend::x64::assembler::{dword_ptr, Address, Reg, RegExp, CodeAssembler, R15};
use crate::backend::x64::emit_context::EmitContext;
use crate::backend::x64::hostloc::HOST_RAX;
use crate::backend::x64::jit_state::JitState;
use crate::backend::x64::reg_alloc::RegAlloc;
use crate::ir::block::Block;
use crate::ir::inst::Inst;
use crate::ir::value::InstRef;

fn xconst(offset: usize) -> Address {
    Address::rip(128, offset)
}

fn qconst(offset: usize) -> Address {
    Address::rip(64, offset)
}

const FPSCR_IDC_BIT: u32 = 1 << 7;
const FPSCR_UFC_BIT: u32 = 1 << 3;
/// Largest `|x| - 1` value that still classifies as a single denormal.
const PENULTIMATE_DENORMAL32: u32 = 0x007F_FFFE;

// ---------------------------------------------------------------------------
// FTZ / DN building blocks
// ---------------------------------------------------------------------------

/// If `xmm_value` holds a single-precision denormal, replace it with +0 and
/// record the input-denormal cumulative bit.
fn denormals_are_zero32(ra: &mut RegAlloc, xmm_value: Reg, gpr_scratch: Reg) {
    let end = ra.asm.create_label();

    ra.asm.movd(gpr_scratch.cvt32(), xmm_value);
    ra.asm.and_(gpr_scratch.cvt32(), 0x7FFF_FFFFi32);
    ra.asm.sub(gpr_scratch.cvt32(), 1i32);
    ra.asm.cmp(gpr_scratch.cvt32(), PENULTIMATE_DENORMAL32 as i32);
    ra.asm.ja(&end);
    ra.asm.pxor(xmm_value, xmm_value);
    ra.asm.mov(
        dword_ptr(RegExp::from(R15) + JitState::offset_of_fpscr_idc() as i32),
        FPSCR_IDC_BIT as i32,
    );
    ra.asm.bind(&end);
}

fn denormals_are_zero64(ctx: &EmitContext, ra: &mut RegAlloc, xmm_value: Reg, gpr_scratch: Reg) {
    let end = ra.asm.create_label();

    ra.asm.movq(gpr_scratch, xmm_value);
    ra.asm.and_(gpr_scratch, qconst(ctx.consts.non_sign_mask64));
    ra.asm.sub(gpr_scratch, 1i32);
    ra.asm.cmp(gpr_scratch, qconst(ctx.consts.penultimate_denormal64));
    ra.asm.ja(&end);
    ra.asm.pxor(xmm_value, xmm_value);
    ra.asm.mov(
        dword_ptr(RegExp::from(R15) + JitState::offset_of_fpscr_idc() as i32),
        FPSCR_IDC_BIT as i32,
    );
    ra.asm.bind(&end);
}

/// If `xmm_value` holds a single-precision denormal result, flush it to +0
/// and record the underflow cumulative bit.
fn flush_to_zero32(ra: &mut RegAlloc, xmm_value: Reg, gpr_scratch: Reg) {
    let end = ra.asm.create_label();

    ra.asm.movd(gpr_scratch.cvt32(), xmm_value);
    ra.asm.and_(gpr_scratch.cvt32(), 0x7FFF_FFFFi32);
    ra.asm.sub(gpr_scratch.cvt32(), 1i32);
    ra.asm.cmp(gpr_scratch.cvt32(), PENULTIMATE_DENORMAL32 as i32);
    ra.asm.ja(&end);
    ra.asm.pxor(xmm_value, xmm_value);
    ra.asm.mov(
        dword_ptr(RegExp::from(R15) + JitState::offset_of_fpscr_ufc() as i32),
        FPSCR_UFC_BIT as i32,
    );
    ra.asm.bind(&end);
}

fn flush_to_zero64(ctx: &EmitContext, ra: &mut RegAlloc, xmm_value: Reg, gpr_scratch: Reg) {
    let end = ra.asm.create_label();

    ra.asm.movq(gpr_scratch, xmm_value);
    ra.asm.and_(gpr_scratch, qconst(ctx.consts.non_sign_mask64));
    ra.asm.sub(gpr_scratch, 1i32);
    ra.asm.cmp(gpr_scratch, qconst(ctx.consts.penultimate_denormal64));
    ra.asm.ja(&end);
    ra.asm.pxor(xmm_value, xmm_value);
    ra.asm.mov(
        dword_ptr(RegExp::from(R15) + JitState::offset_of_fpscr_ufc() as i32),
        FPSCR_UFC_BIT as i32,
    );
    ra.asm.bind(&end);
}

fn default_nan32(ctx: &EmitContext, ra: &mut RegAlloc, xmm_value: Reg) {
    let end = ra.asm.create_label();
    ra.asm.ucomiss(xmm_value, xmm_value);
    ra.asm.jnp(&end);
    ra.asm.movaps(xmm_value, xconst(ctx.consts.nan32));
    ra.asm.bind(&end);
}

fn default_nan64(ctx: &EmitContext, ra: &mut RegAlloc, xmm_value: Reg) {
    let end = ra.asm.create_label();
    ra.asm.ucomisd(xmm_value, xmm_value);
    ra.asm.jnp(&end);
    ra.asm.movaps(xmm_value, xconst(ctx.consts.nan64));
    ra.asm.bind(&end);
}

/// Replace a NaN with +0 using an ordered-compare mask.
fn zero_if_nan64(ra: &mut RegAlloc, xmm_value: Reg, xmm_scratch: Reg) {
    ra.asm.pxor(xmm_scratch, xmm_scratch);
    ra.asm.cmpordsd(xmm_scratch, xmm_value);
    ra.asm.pand(xmm_value, xmm_scratch);
}

// ---------------------------------------------------------------------------
// GPR <-> FP transfers
// ---------------------------------------------------------------------------

pub fn emit_transfer_to_fp32(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    if args[0].is_immediate() && args[0].get_immediate_u32() == 0 {
        ra.discard_use(&mut args[0]);
        let result = ra.def_xmm(inst_ref);
        ra.asm.xorps(result, result);
    } else {
        let source = ra.use_gpr(&mut args[0]);
        let result = ra.def_xmm(inst_ref);
        ra.asm.movd(result, source.cvt32());
    }
}

pub fn emit_transfer_from_fp32(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let source = ra.use_xmm(&mut args[0]);
    let result = ra.def_gpr(inst_ref);
    ra.asm.movd(result.cvt32(), source);
}

pub fn emit_transfer_to_fp64(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    if args[0].is_immediate() && args[0].get_immediate_u64() == 0 {
        ra.discard_use(&mut args[0]);
        let result = ra.def_xmm(inst_ref);
        ra.asm.xorps(result, result);
    } else {
        let source = ra.use_gpr(&mut args[0]);
        let result = ra.def_xmm(inst_ref);
        ra.asm.movq(result, source);
    }
}

pub fn emit_transfer_from_fp64(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let source = ra.use_xmm(&mut args[0]);
    let result = ra.def_gpr(inst_ref);
    ra.asm.movq(result, source);
}

// ---------------------------------------------------------------------------
// Sign manipulation
// ---------------------------------------------------------------------------

pub fn emit_fp_abs32(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_xmm(&mut args[0], inst_ref);
    ra.asm.pand(result, xconst(ctx.consts.non_sign_mask32));
}

pub fn emit_fp_abs64(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_xmm(&mut args[0], inst_ref);
    ra.asm.pand(result, xconst(ctx.consts.non_sign_mask64));
}

pub fn emit_fp_neg32(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_xmm(&mut args[0], inst_ref);
    ra.asm.pxor(result, xconst(ctx.consts.negative_zero32));
}

pub fn emit_fp_neg64(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_xmm(&mut args[0], inst_ref);
    ra.asm.pxor(result, xconst(ctx.consts.negative_zero64));
}

// ---------------------------------------------------------------------------
// Arithmetic
// ---------------------------------------------------------------------------

fn fp_three_op32(
    ctx: &EmitContext,
    ra: &mut RegAlloc,
    inst_ref: InstRef,
    inst: &Inst,
    op: fn(&mut CodeAssembler, Reg, Reg),
) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_xmm(&mut args[0], inst_ref);
    let operand = ra.use_xmm(&mut args[1]);
    let gpr_scratch = ra.scratch_gpr();

    if ctx.ftz() {
        denormals_are_zero32(ra, result, gpr_scratch);
        denormals_are_zero32(ra, operand, gpr_scratch);
    }
    op(ra.asm, result, operand);
    if ctx.ftz() {
        flush_to_zero32(ra, result, gpr_scratch);
    }
    if ctx.dn() {
        default_nan32(ctx, ra, result);
    }
}

fn fp_three_op64(
    ctx: &EmitContext,
    ra: &mut RegAlloc,
    inst_ref: InstRef,
    inst: &Inst,
    op: fn(&mut CodeAssembler, Reg, Reg),
) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_xmm(&mut args[0], inst_ref);
    let operand = ra.use_xmm(&mut args[1]);
    let gpr_scratch = ra.scratch_gpr();

    if ctx.ftz() {
        denormals_are_zero64(ctx, ra, result, gpr_scratch);
        denormals_are_zero64(ctx, ra, operand, gpr_scratch);
    }
    op(ra.asm, result, operand);
    if ctx.ftz() {
        flush_to_zero64(ctx, ra, result, gpr_scratch);
    }
    if ctx.dn() {
        default_nan64(ctx, ra, result);
    }
}

fn fp_two_op32(
    ctx: &EmitContext,
    ra: &mut RegAlloc,
    inst_ref: InstRef,
    inst: &Inst,
    op: fn(&mut CodeAssembler, Reg, Reg),
) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_xmm(&mut args[0], inst_ref);
    let gpr_scratch = ra.scratch_gpr();

    if ctx.ftz() {
        denormals_are_zero32(ra, result, gpr_scratch);
    }
    op(ra.asm, result, result);
    if ctx.ftz() {
        flush_to_zero32(ra, result, gpr_scratch);
    }
    if ctx.dn() {
        default_nan32(ctx, ra, result);
    }
}

fn fp_two_op64(
    ctx: &EmitContext,
    ra: &mut RegAlloc,
    inst_ref: InstRef,
    inst: &Inst,
    op: fn(&mut CodeAssembler, Reg, Reg),
) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_xmm(&mut args[0], inst_ref);
    let gpr_scratch = ra.scratch_gpr();

    if ctx.ftz() {
        denormals_are_zero64(ctx, ra, result, gpr_scratch);
    }
    op(ra.asm, result, result);
    if ctx.ftz() {
        flush_to_zero64(ctx, ra, result, gpr_scratch);
    }
    if ctx.dn() {
        default_nan64(ctx, ra, result);
    }
}

pub fn emit_fp_add32(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    fp_three_op32(ctx, ra, inst_ref, inst, |asm, a, b| asm.addss(a, b));
}

pub fn emit_fp_add64(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    fp_three_op64(ctx, ra, inst_ref, inst, |asm, a, b| asm.addsd(a, b));
}

pub fn emit_fp_sub32(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    fp_three_op32(ctx, ra, inst_ref, inst, |asm, a, b| asm.subss(a, b));
}

pub fn emit_fp_sub64(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    fp_three_op64(ctx, ra, inst_ref, inst, |asm, a, b| asm.subsd(a, b));
}

pub fn emit_fp_mul32(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    fp_three_op32(ctx, ra, inst_ref, inst, |asm, a, b| asm.mulss(a, b));
}

pub fn emit_fp_mul64(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    fp_three_op64(ctx, ra, inst_ref, inst, |asm, a, b| asm.mulsd(a, b));
}

pub fn emit_fp_div32(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    fp_three_op32(ctx, ra, inst_ref, inst, |asm, a, b| asm.divss(a, b));
}

pub fn emit_fp_div64(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    fp_three_op64(ctx, ra, inst_ref, inst, |asm, a, b| asm.divsd(a, b));
}

pub fn emit_fp_sqrt32(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    fp_two_op32(ctx, ra, inst_ref, inst, |asm, a, b| asm.sqrtss(a, b));
}

pub fn emit_fp_sqrt64(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    fp_two_op64(ctx, ra, inst_ref, inst, |asm, a, b| asm.sqrtsd(a, b));
}

// ---------------------------------------------------------------------------
// Compare
// ---------------------------------------------------------------------------

/// Decode host {PF, ZF, CF} after a scalar compare into the ARM NZCV field
/// of FPSCR: unordered -> CV, greater -> C, less -> N, equal -> ZC.
fn set_fpscr_nzcv_from_flags(ra: &mut RegAlloc) {
    // LAHF materialises the flags in AH.
    let _rax = ra.scratch_gpr_at(HOST_RAX);
    let nzcv_imm = ra.scratch_gpr().cvt32();
    let nzcv = ra.scratch_gpr().cvt32();

    ra.asm.lahf();
    ra.asm.mov(nzcv_imm, 0x3000_0000i32);
    ra.asm.cmp_ah(0b0100_0111);
    ra.asm.cmove(nzcv, nzcv_imm);
    ra.asm.mov(nzcv_imm, 0x2000_0000i32);
    ra.asm.cmp_ah(0b0000_0010);
    ra.asm.cmove(nzcv, nzcv_imm);
    ra.asm.mov(nzcv_imm, 0x8000_0000u32 as i32);
    ra.asm.cmp_ah(0b0000_0011);
    ra.asm.cmove(nzcv, nzcv_imm);
    ra.asm.mov(nzcv_imm, 0x6000_0000i32);
    ra.asm.cmp_ah(0b0100_0010);
    ra.asm.cmove(nzcv, nzcv_imm);
    ra.asm.mov(
        dword_ptr(RegExp::from(R15) + JitState::offset_of_fpscr_nzcv() as i32),
        nzcv,
    );
}

pub fn emit_fp_compare32(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let _ = inst_ref;
    let mut args = ra.get_argument_info(inst);
    let quiet = args[2].get_immediate_u1();
    ra.discard_use(&mut args[2]);
    let reg_a = ra.use_xmm(&mut args[0]);
    let reg_b = ra.use_xmm(&mut args[1]);

    if quiet {
        ra.asm.ucomiss(reg_a, reg_b);
    } else {
        ra.asm.comiss(reg_a, reg_b);
    }

    set_fpscr_nzcv_from_flags(ra);
}

pub fn emit_fp_compare64(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let _ = inst_ref;
    let mut args = ra.get_argument_info(inst);
    let quiet = args[2].get_immediate_u1();
    ra.discard_use(&mut args[2]);
    let reg_a = ra.use_xmm(&mut args[0]);
    let reg_b = ra.use_xmm(&mut args[1]);

    if quiet {
        ra.asm.ucomisd(reg_a, reg_b);
    } else {
        ra.asm.comisd(reg_a, reg_b);
    }

    set_fpscr_nzcv_from_flags(ra);
}

// ---------------------------------------------------------------------------
// Precision conversions
// ---------------------------------------------------------------------------

pub fn emit_fp_single_to_double(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_xmm(&mut args[0], inst_ref);
    let gpr_scratch = ra.scratch_gpr();

    if ctx.ftz() {
        denormals_are_zero32(ra, result, gpr_scratch);
    }
    ra.asm.cvtss2sd(result, result);
    if ctx.ftz() {
        flush_to_zero64(ctx, ra, result, gpr_scratch);
    }
    if ctx.dn() {
        default_nan64(ctx, ra, result);
    }
}

pub fn emit_fp_double_to_single(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_xmm(&mut args[0], inst_ref);
    let gpr_scratch = ra.scratch_gpr();

    if ctx.ftz() {
        denormals_are_zero64(ctx, ra, result, gpr_scratch);
    }
    ra.asm.cvtsd2ss(result, result);
    if ctx.ftz() {
        flush_to_zero32(ra, result, gpr_scratch);
    }
    if ctx.dn() {
        default_nan32(ctx, ra, result);
    }
}

// ---------------------------------------------------------------------------
// FP -> integer (saturating)
// ---------------------------------------------------------------------------

pub fn emit_fp_single_to_s32(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let round_towards_zero = args[1].get_immediate_u1();
    ra.discard_use(&mut args[1]);

    let from = ra.use_scratch_xmm(&mut args[0]);
    let to = ra.def_xmm(inst_ref);
    let gpr_scratch = ra.scratch_gpr();
    let xmm_scratch = ra.scratch_xmm();

    // ARM saturates on conversion; the host returns a sentinel instead.
    // Converting to double first is lossless and makes clamping exact.
    if ctx.ftz() {
        denormals_are_zero32(ra, from, gpr_scratch);
    }
    ra.asm.cvtss2sd(from, from);
    // First conversion raises the host flags.
    if round_towards_zero {
        ra.asm.cvttsd2si(gpr_scratch.cvt32(), from);
    } else {
        ra.asm.cvtsd2si(gpr_scratch.cvt32(), from);
    }
    zero_if_nan64(ra, from, xmm_scratch);
    ra.asm.minsd(from, qconst(ctx.consts.max_s32));
    ra.asm.maxsd(from, qconst(ctx.consts.min_s32));
    if round_towards_zero {
        ra.asm.cvttsd2si(gpr_scratch.cvt32(), from);
    } else {
        ra.asm.cvtsd2si(gpr_scratch.cvt32(), from);
    }
    ra.asm.movd(to, gpr_scratch.cvt32());
}

pub fn emit_fp_double_to_s32(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let round_towards_zero = args[1].get_immediate_u1();
    ra.discard_use(&mut args[1]);

    let from = ra.use_scratch_xmm(&mut args[0]);
    let to = ra.def_xmm(inst_ref);
    let gpr_scratch = ra.scratch_gpr();
    let xmm_scratch = ra.scratch_xmm();

    if ctx.ftz() {
        denormals_are_zero64(ctx, ra, from, gpr_scratch);
    }
    if round_towards_zero {
        ra.asm.cvttsd2si(gpr_scratch.cvt32(), from);
    } else {
        ra.asm.cvtsd2si(gpr_scratch.cvt32(), from);
    }
    zero_if_nan64(ra, from, xmm_scratch);
    ra.asm.minsd(from, qconst(ctx.consts.max_s32));
    ra.asm.maxsd(from, qconst(ctx.consts.min_s32));
    if round_towards_zero {
        ra.asm.cvttsd2si(gpr_scratch.cvt32(), from);
    } else {
        ra.asm.cvtsd2si(gpr_scratch.cvt32(), from);
    }
    ra.asm.movd(to, gpr_scratch.cvt32());
}

/// Common tail of the unsigned conversions. SSE2 has no unsigned convert,
/// so the value is shifted into signed range where needed and shifted back
/// after conversion.
///
/// The host inexact exception is not raised exactly as IEEE requires on
/// these paths; FPSCR.IXC consumers should not rely on it.
fn fp_to_u32(ctx: &EmitContext, ra: &mut RegAlloc, from: Reg, to: Reg, round_towards_zero: bool) {
    let gpr_scratch = ra.scratch_gpr();
    let xmm_scratch = ra.scratch_xmm();

    if ctx.rmode() != 3 && !round_towards_zero {
        // Rounding happens during cvtsd2si; bias into signed range first.
        zero_if_nan64(ra, from, xmm_scratch);
        ra.asm.addsd(from, qconst(ctx.consts.min_s32));
        ra.asm.cvtsd2si(gpr_scratch.cvt32(), from);
        ra.asm.minsd(from, qconst(ctx.consts.max_s32));
        ra.asm.maxsd(from, qconst(ctx.consts.min_s32));
        ra.asm.cvtsd2si(gpr_scratch.cvt32(), from);
        ra.asm.add(gpr_scratch.cvt32(), 0x8000_0000u32 as i32);
        ra.asm.movd(to, gpr_scratch.cvt32());
    } else {
        let xmm_mask = ra.scratch_xmm();
        let gpr_mask = ra.scratch_gpr().cvt32();

        zero_if_nan64(ra, from, xmm_scratch);
        // Build masks selecting inputs beyond the signed boundary.
        ra.asm.movaps(xmm_mask, xconst(ctx.consts.max_s32));
        ra.asm.cmpltsd(xmm_mask, from);
        ra.asm.movd(gpr_mask, xmm_mask);
        ra.asm.pand(xmm_mask, xconst(ctx.consts.min_s32));
        ra.asm.and_(gpr_mask, 0x8000_0000u32 as i32);
        // Shift oversized inputs into range.
        ra.asm.addsd(from, xmm_mask);
        ra.asm.cvttsd2si(gpr_scratch.cvt32(), from);
        ra.asm.minsd(from, qconst(ctx.consts.max_s32));
        ra.asm.maxsd(from, qconst(ctx.consts.min_u32));
        ra.asm.cvttsd2si(gpr_scratch.cvt32(), from);
        // Undo the shift.
        ra.asm.add(gpr_scratch.cvt32(), gpr_mask);
        ra.asm.movd(to, gpr_scratch.cvt32());
    }
}

pub fn emit_fp_single_to_u32(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let round_towards_zero = args[1].get_immediate_u1();
    ra.discard_use(&mut args[1]);

    let from = ra.use_scratch_xmm(&mut args[0]);
    let to = ra.def_xmm(inst_ref);

    if ctx.ftz() {
        let gpr_scratch = ra.scratch_gpr();
        denormals_are_zero32(ra, from, gpr_scratch);
    }
    ra.asm.cvtss2sd(from, from);
    fp_to_u32(ctx, ra, from, to, round_towards_zero);
}

pub fn emit_fp_double_to_u32(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let round_towards_zero = args[1].get_immediate_u1();
    ra.discard_use(&mut args[1]);

    let from = ra.use_scratch_xmm(&mut args[0]);
    let to = ra.def_xmm(inst_ref);

    if ctx.ftz() {
        let gpr_scratch = ra.scratch_gpr();
        denormals_are_zero64(ctx, ra, from, gpr_scratch);
    }
    fp_to_u32(ctx, ra, from, to, round_towards_zero);
}

// ---------------------------------------------------------------------------
// Integer -> FP
// ---------------------------------------------------------------------------

pub fn emit_fp_s32_to_single(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let round_to_nearest = args[1].get_immediate_u1();
    assert!(!round_to_nearest, "round_to_nearest is not generated");
    ra.discard_use(&mut args[1]);

    let from = ra.use_xmm(&mut args[0]);
    let to = ra.def_xmm(inst_ref);
    let gpr_scratch = ra.scratch_gpr().cvt32();

    ra.asm.movd(gpr_scratch, from);
    ra.asm.cvtsi2ss(to, gpr_scratch);
}

pub fn emit_fp_u32_to_single(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let round_to_nearest = args[1].get_immediate_u1();
    assert!(!round_to_nearest, "round_to_nearest is not generated");
    ra.discard_use(&mut args[1]);

    let from = ra.use_xmm(&mut args[0]);
    let to = ra.def_xmm(inst_ref);
    // A 64-bit intermediate keeps the input unsigned.
    let gpr_scratch = ra.scratch_gpr();

    ra.asm.movq(gpr_scratch, from);
    ra.asm.cvtsi2ss(to, gpr_scratch);
}

pub fn emit_fp_s32_to_double(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let round_to_nearest = args[1].get_immediate_u1();
    assert!(!round_to_nearest, "round_to_nearest is not generated");
    ra.discard_use(&mut args[1]);

    let from = ra.use_xmm(&mut args[0]);
    let to = ra.def_xmm(inst_ref);
    let gpr_scratch = ra.scratch_gpr().cvt32();

    ra.asm.movd(gpr_scratch, from);
    ra.asm.cvtsi2sd(to, gpr_scratch);
}

pub fn emit_fp_u32_to_double(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let round_to_nearest = args[1].get_immediate_u1();
    assert!(!round_to_nearest, "round_to_nearest is not generated");
    ra.discard_use(&mut args[1]);

    let from = ra.use_xmm(&mut args[0]);
    let to = ra.def_xmm(inst_ref);
    let gpr_scratch = ra.scratch_gpr();

    ra.asm.movq(gpr_scratch, from);
    ra.asm.cvtsi2sd(to, gpr_scratch);
}
