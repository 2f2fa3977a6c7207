//! Lowerings for casts, shifts, arithmetic, bitwise and bit-utility
//! opcodes.
//!
//! The shift lowerings are where ARM and x86 semantics diverge the most:
//! ARM does not mask shift counts, the carry-out of a zero-count shift is
//! the carry-in, and rotates by multiples of 32 update carry without moving
//! bits. Each case below reproduces the architectural result exactly.

use crate::backend::x64::assembler::{Op, Reg, CL};
use crate::backend::x64::emit_context::EmitContext;
use crate::backend::x64::hostloc::HOST_RCX;
use crate::backend::x64::reg_alloc::{Argument, RegAlloc};
use crate::ir::block::Block;
use crate::ir::inst::Inst;
use crate::ir::opcode::Opcode;
use crate::ir::value::InstRef;

/// Detach the pseudo-op of kind `kind` hanging off `inst_ref`, if present.
/// The parent's lowering becomes responsible for defining its result.
pub fn take_pseudo_op(
    block: &mut Block,
    ra: &mut RegAlloc,
    inst_ref: InstRef,
    kind: Opcode,
) -> Option<InstRef> {
    let pseudo = block.associated_pseudo_op(inst_ref, kind)?;
    block.erase_pseudo_op(pseudo);
    ra.decrement_remaining_uses(inst_ref);
    Some(pseudo)
}

/// Deliver the carry-in argument into a register that will also receive the
/// carry-out, mirroring how two-operand shifts reuse their operand.
fn do_carry(ra: &mut RegAlloc, carry_arg: &mut Argument, carry_out: Option<InstRef>) -> Option<Reg> {
    let carry_out = carry_out?;
    if carry_arg.is_immediate() {
        let value = carry_arg.get_immediate_u1();
        ra.discard_use(carry_arg);
        let reg = ra.def_gpr(carry_out);
        ra.asm.mov(reg.cvt32(), value as i32);
        Some(reg)
    } else {
        Some(ra.use_def_gpr(carry_arg, carry_out))
    }
}

// ---------------------------------------------------------------------------
// Identity and casts
// ---------------------------------------------------------------------------

pub fn emit_identity(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    ra.register_add_def(inst_ref, &mut args[0]);
}

pub fn emit_least_significant_word(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    ra.register_add_def(inst_ref, &mut args[0]);
}

pub fn emit_least_significant_half(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    ra.register_add_def(inst_ref, &mut args[0]);
}

pub fn emit_least_significant_byte(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    ra.register_add_def(inst_ref, &mut args[0]);
}

pub fn emit_most_significant_word(_ctx: &EmitContext, ra: &mut RegAlloc, block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let carry_inst = take_pseudo_op(block, ra, inst_ref, Opcode::GetCarryFromOp);

    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_gpr(&mut args[0], inst_ref);
    ra.asm.shr(result, 32);

    if let Some(carry_inst) = carry_inst {
        let carry = ra.def_gpr(carry_inst);
        ra.asm.setc(carry.cvt8());
    }
}

pub fn emit_pack_2x32_to_1x64(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_gpr(&mut args[0], inst_ref);
    let hi = ra.use_scratch_gpr(&mut args[1]);

    ra.asm.shl(hi, 32);
    ra.asm.mov(result.cvt32(), result.cvt32()); // zero-extend the low half
    ra.asm.or_(result, hi);
}

pub fn emit_most_significant_bit(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_gpr(&mut args[0], inst_ref);
    ra.asm.shr(result.cvt32(), 31);
}

pub fn emit_is_zero(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_gpr(&mut args[0], inst_ref);
    ra.asm.test(result.cvt32(), result.cvt32());
    ra.asm.setz(result.cvt8());
    ra.asm.movzx(result.cvt32(), result.cvt8());
}

pub fn emit_is_zero64(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_gpr(&mut args[0], inst_ref);
    ra.asm.test(result, result);
    ra.asm.setz(result.cvt8());
    ra.asm.movzx(result.cvt32(), result.cvt8());
}

// ---------------------------------------------------------------------------
// Shifts
// ---------------------------------------------------------------------------

pub fn emit_logical_shift_left(_ctx: &EmitContext, ra: &mut RegAlloc, block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let carry_inst = take_pseudo_op(block, ra, inst_ref, Opcode::GetCarryFromOp);
    let mut args = ra.get_argument_info(inst);

    if carry_inst.is_none() {
        ra.discard_use(&mut args[2]);

        if args[1].is_immediate() {
            let shift = args[1].get_immediate_u8();
            ra.discard_use(&mut args[1]);
            let result = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();

            if shift <= 31 {
                ra.asm.shl(result, shift);
            } else {
                ra.asm.xor_(result, result);
            }
        } else {
            let _shift = ra.use_at(&mut args[1], HOST_RCX);
            let result = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();
            let zero = ra.scratch_gpr().cvt32();

            // x86 masks 32-bit shift counts by 0x1F; ARM does not, so
            // counts of 32 and above must produce zero.
            ra.asm.shl_cl(result);
            ra.asm.xor_(zero, zero);
            ra.asm.cmp(CL, 32i32);
            ra.asm.cmovnb(result, zero);
        }
    } else if args[1].is_immediate() {
        let shift = args[1].get_immediate_u8();
        ra.discard_use(&mut args[1]);
        let carry = do_carry(ra, &mut args[2], carry_inst).unwrap();
        let result = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();

        if shift == 0 {
            // Carry-out is the carry-in; both registers already hold it.
        } else if shift < 32 {
            ra.asm.bt(carry.cvt32(), 0);
            ra.asm.shl(result, shift);
            ra.asm.setc(carry.cvt8());
        } else if shift > 32 {
            ra.asm.xor_(result, result);
            ra.asm.xor_(carry.cvt32(), carry.cvt32());
        } else {
            ra.asm.mov(carry.cvt32(), result);
            ra.asm.xor_(result, result);
            ra.asm.and_(carry.cvt32(), 1i32);
        }
    } else {
        let _shift = ra.use_at(&mut args[1], HOST_RCX);
        let carry = do_carry(ra, &mut args[2], carry_inst).unwrap().cvt32();
        let result = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();

        let rs_gt32 = ra.asm.create_label();
        let rs_eq32 = ra.asm.create_label();
        let end = ra.asm.create_label();

        ra.asm.cmp(CL, 32i32);
        ra.asm.ja(&rs_gt32);
        ra.asm.je(&rs_eq32);
        // shift < 32: preload CF with the carry-in so a zero count
        // falls out of shl leaving the flags untouched.
        ra.asm.bt(carry, 0);
        ra.asm.shl_cl(result);
        ra.asm.setc(carry.cvt8());
        ra.asm.jmp(&end);
        // shift > 32
        ra.asm.bind(&rs_gt32);
        ra.asm.xor_(result, result);
        ra.asm.xor_(carry, carry);
        ra.asm.jmp(&end);
        // shift == 32: carry takes bit 0, result becomes zero
        ra.asm.bind(&rs_eq32);
        ra.asm.mov(carry, result);
        ra.asm.and_(carry, 1i32);
        ra.asm.xor_(result, result);
        ra.asm.bind(&end);
    }
}

pub fn emit_logical_shift_right(_ctx: &EmitContext, ra: &mut RegAlloc, block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let carry_inst = take_pseudo_op(block, ra, inst_ref, Opcode::GetCarryFromOp);
    let mut args = ra.get_argument_info(inst);

    if carry_inst.is_none() {
        ra.discard_use(&mut args[2]);

        if args[1].is_immediate() {
            let shift = args[1].get_immediate_u8();
            ra.discard_use(&mut args[1]);
            let result = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();

            if shift <= 31 {
                ra.asm.shr(result, shift);
            } else {
                ra.asm.xor_(result, result);
            }
        } else {
            let _shift = ra.use_at(&mut args[1], HOST_RCX);
            let result = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();
            let zero = ra.scratch_gpr().cvt32();

            ra.asm.shr_cl(result);
            ra.asm.xor_(zero, zero);
            ra.asm.cmp(CL, 32i32);
            ra.asm.cmovnb(result, zero);
        }
    } else if args[1].is_immediate() {
        let shift = args[1].get_immediate_u8();
        ra.discard_use(&mut args[1]);
        let carry = do_carry(ra, &mut args[2], carry_inst).unwrap();
        let result = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();

        if shift == 0 {
            // Carry-out is the carry-in.
        } else if shift < 32 {
            ra.asm.shr(result, shift);
            ra.asm.setc(carry.cvt8());
        } else if shift == 32 {
            ra.asm.bt(result, 31);
            ra.asm.setc(carry.cvt8());
            ra.asm.mov(result, 0i32);
        } else {
            ra.asm.xor_(result, result);
            ra.asm.xor_(carry.cvt32(), carry.cvt32());
        }
    } else {
        let _shift = ra.use_at(&mut args[1], HOST_RCX);
        let carry = do_carry(ra, &mut args[2], carry_inst).unwrap().cvt32();
        let result = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();

        let rs_gt32 = ra.asm.create_label();
        let rs_eq32 = ra.asm.create_label();
        let end = ra.asm.create_label();

        ra.asm.cmp(CL, 32i32);
        ra.asm.ja(&rs_gt32);
        ra.asm.je(&rs_eq32);
        // shift == 0: carry and result are already correct
        ra.asm.test(CL, CL);
        ra.asm.jz(&end);
        // 0 < shift < 32
        ra.asm.shr_cl(result);
        ra.asm.setc(carry.cvt8());
        ra.asm.jmp(&end);
        // shift > 32
        ra.asm.bind(&rs_gt32);
        ra.asm.xor_(result, result);
        ra.asm.xor_(carry, carry);
        ra.asm.jmp(&end);
        // shift == 32: carry takes bit 31, result becomes zero
        ra.asm.bind(&rs_eq32);
        ra.asm.bt(result, 31);
        ra.asm.setc(carry.cvt8());
        ra.asm.xor_(result, result);
        ra.asm.bind(&end);
    }
}

pub fn emit_logical_shift_right64(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    assert!(args[1].is_immediate(), "Variable 64-bit shifts are not generated");
    let shift = args[1].get_immediate_u8();
    assert!(shift < 64);
    ra.discard_use(&mut args[1]);

    let result = ra.use_def_gpr(&mut args[0], inst_ref);
    ra.asm.shr(result, shift);
}

pub fn emit_arithmetic_shift_right(_ctx: &EmitContext, ra: &mut RegAlloc, block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let carry_inst = take_pseudo_op(block, ra, inst_ref, Opcode::GetCarryFromOp);
    let mut args = ra.get_argument_info(inst);

    if carry_inst.is_none() {
        ra.discard_use(&mut args[2]);

        if args[1].is_immediate() {
            let shift = args[1].get_immediate_u8();
            ra.discard_use(&mut args[1]);
            let result = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();

            // Every count above 31 behaves like 31.
            ra.asm.sar(result, shift.min(31));
        } else {
            let shift = ra.use_scratch_at(&mut args[1], HOST_RCX).cvt32();
            let result = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();
            let const31 = ra.scratch_gpr().cvt32();

            ra.asm.mov(const31, 31i32);
            ra.asm.movzx(shift, shift.cvt8());
            ra.asm.cmp(shift, 31i32);
            ra.asm.cmovg(shift, const31);
            ra.asm.sar_cl(result);
        }
    } else if args[1].is_immediate() {
        let shift = args[1].get_immediate_u8();
        ra.discard_use(&mut args[1]);
        let carry = do_carry(ra, &mut args[2], carry_inst).unwrap();
        let result = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();

        if shift == 0 {
            // Carry-out is the carry-in.
        } else if shift <= 31 {
            ra.asm.sar(result, shift);
            ra.asm.setc(carry.cvt8());
        } else {
            ra.asm.sar(result, 31);
            ra.asm.bt(result, 31);
            ra.asm.setc(carry.cvt8());
        }
    } else {
        let _shift = ra.use_at(&mut args[1], HOST_RCX);
        let carry = do_carry(ra, &mut args[2], carry_inst).unwrap().cvt32();
        let result = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();

        let rs_gt31 = ra.asm.create_label();
        let end = ra.asm.create_label();

        ra.asm.cmp(CL, 31i32);
        ra.asm.ja(&rs_gt31);
        // shift == 0: nothing to do
        ra.asm.test(CL, CL);
        ra.asm.jz(&end);
        // 1 <= shift <= 31
        ra.asm.sar_cl(result);
        ra.asm.setc(carry.cvt8());
        ra.asm.jmp(&end);
        // shift > 31: same result as 31, carry from the sign bit
        ra.asm.bind(&rs_gt31);
        ra.asm.sar(result, 31);
        ra.asm.bt(result, 31);
        ra.asm.setc(carry.cvt8());
        ra.asm.bind(&end);
    }
}

pub fn emit_rotate_right(_ctx: &EmitContext, ra: &mut RegAlloc, block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let carry_inst = take_pseudo_op(block, ra, inst_ref, Opcode::GetCarryFromOp);
    let mut args = ra.get_argument_info(inst);

    if carry_inst.is_none() {
        ra.discard_use(&mut args[2]);

        if args[1].is_immediate() {
            let shift = args[1].get_immediate_u8();
            ra.discard_use(&mut args[1]);
            let result = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();
            ra.asm.ror(result, shift & 0x1F);
        } else {
            let _shift = ra.use_at(&mut args[1], HOST_RCX);
            let result = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();
            // The host rotate masks the count for us.
            ra.asm.ror_cl(result);
        }
    } else if args[1].is_immediate() {
        let shift = args[1].get_immediate_u8();
        ra.discard_use(&mut args[1]);
        let carry = do_carry(ra, &mut args[2], carry_inst).unwrap();
        let result = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();

        if shift == 0 {
            // Carry-out is the carry-in.
        } else if shift & 0x1F == 0 {
            // Rotation by a multiple of 32 moves nothing but still sets
            // carry from bit 31.
            ra.asm.bt(result, 31);
            ra.asm.setc(carry.cvt8());
        } else {
            ra.asm.ror(result, shift & 0x1F);
            ra.asm.setc(carry.cvt8());
        }
    } else {
        let shift = ra.use_scratch_at(&mut args[1], HOST_RCX);
        let carry = do_carry(ra, &mut args[2], carry_inst).unwrap().cvt32();
        let result = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();

        let zero_1f = ra.asm.create_label();
        let end = ra.asm.create_label();

        // (count & 0xFF) == 0: carry is preserved, nothing moves.
        ra.asm.test(shift.cvt8(), shift.cvt8());
        ra.asm.jz(&end);

        ra.asm.and_(shift.cvt32(), 0x1Fi32);
        ra.asm.jz(&zero_1f);
        // count & 0x1F != 0
        ra.asm.ror_cl(result);
        ra.asm.setc(carry.cvt8());
        ra.asm.jmp(&end);
        // nonzero multiple of 32
        ra.asm.bind(&zero_1f);
        ra.asm.bt(result, 31);
        ra.asm.setc(carry.cvt8());
        ra.asm.bind(&end);
    }
}

/// 33-bit rotate through carry by one position.
pub fn emit_rotate_right_extended(_ctx: &EmitContext, ra: &mut RegAlloc, block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let carry_inst = take_pseudo_op(block, ra, inst_ref, Opcode::GetCarryFromOp);
    let mut args = ra.get_argument_info(inst);

    let carry = match carry_inst {
        Some(carry_inst) => do_carry(ra, &mut args[1], Some(carry_inst)).unwrap(),
        None => ra.use_gpr(&mut args[1]),
    };
    let result = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();

    ra.asm.bt(carry.cvt32(), 0);
    ra.asm.rcr(result, 1);

    if carry_inst.is_some() {
        ra.asm.setc(carry.cvt8());
    }
}

// ---------------------------------------------------------------------------
// Arithmetic
// ---------------------------------------------------------------------------

pub fn emit_add_with_carry(_ctx: &EmitContext, ra: &mut RegAlloc, block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let carry_inst = take_pseudo_op(block, ra, inst_ref, Opcode::GetCarryFromOp);
    let overflow_inst = take_pseudo_op(block, ra, inst_ref, Opcode::GetOverflowFromOp);

    let mut args = ra.get_argument_info(inst);
    let carry_in_imm = args[2].is_immediate().then(|| args[2].get_immediate_u1());

    let carry = match carry_inst {
        Some(c) if carry_in_imm.is_none() => Some(ra.use_def_gpr(&mut args[2], c)),
        Some(c) => {
            ra.discard_use(&mut args[2]);
            Some(ra.def_gpr(c))
        }
        None if carry_in_imm.is_none() => Some(ra.use_gpr(&mut args[2])),
        None => {
            ra.discard_use(&mut args[2]);
            None
        }
    };
    let overflow = overflow_inst.map(|o| ra.def_gpr(o));

    let result = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();
    let op_arg: Op = if args[1].is_immediate() {
        let imm = args[1].get_immediate_u32() as i32;
        ra.discard_use(&mut args[1]);
        imm.into()
    } else {
        ra.use_gpr(&mut args[1]).cvt32().into()
    };

    match carry_in_imm {
        Some(false) => ra.asm.add(result, op_arg),
        Some(true) => {
            ra.asm.stc();
            ra.asm.adc(result, op_arg);
        }
        None => {
            ra.asm.bt(carry.unwrap().cvt32(), 0);
            ra.asm.adc(result, op_arg);
        }
    }

    if carry_inst.is_some() {
        ra.asm.setc(carry.unwrap().cvt8());
    }
    if let Some(overflow) = overflow {
        ra.asm.seto(overflow.cvt8());
    }
}

pub fn emit_sub_with_carry(_ctx: &EmitContext, ra: &mut RegAlloc, block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let carry_inst = take_pseudo_op(block, ra, inst_ref, Opcode::GetCarryFromOp);
    let overflow_inst = take_pseudo_op(block, ra, inst_ref, Opcode::GetOverflowFromOp);

    let mut args = ra.get_argument_info(inst);
    let carry_in_imm = args[2].is_immediate().then(|| args[2].get_immediate_u1());

    let carry = match carry_inst {
        Some(c) if carry_in_imm.is_none() => Some(ra.use_def_gpr(&mut args[2], c)),
        Some(c) => {
            ra.discard_use(&mut args[2]);
            Some(ra.def_gpr(c))
        }
        None if carry_in_imm.is_none() => Some(ra.use_gpr(&mut args[2])),
        None => {
            ra.discard_use(&mut args[2]);
            None
        }
    };
    let overflow = overflow_inst.map(|o| ra.def_gpr(o));

    let result = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();
    let op_arg: Op = if args[1].is_immediate() {
        let imm = args[1].get_immediate_u32() as i32;
        ra.discard_use(&mut args[1]);
        imm.into()
    } else {
        ra.use_gpr(&mut args[1]).cvt32().into()
    };

    // ARM computes a + NOT(b) + carry; the host carry flag is the inverse
    // of the ARM carry for subtraction.
    match carry_in_imm {
        Some(true) => ra.asm.sub(result, op_arg),
        Some(false) => {
            ra.asm.stc();
            ra.asm.sbb(result, op_arg);
        }
        None => {
            ra.asm.bt(carry.unwrap().cvt32(), 0);
            ra.asm.cmc();
            ra.asm.sbb(result, op_arg);
        }
    }

    if carry_inst.is_some() {
        ra.asm.setnc(carry.unwrap().cvt8());
    }
    if let Some(overflow) = overflow {
        ra.asm.seto(overflow.cvt8());
    }
}

pub fn emit_add64(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_gpr(&mut args[0], inst_ref);
    let op_arg = ra.use_gpr(&mut args[1]);
    ra.asm.add(result, op_arg);
}

pub fn emit_sub64(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_gpr(&mut args[0], inst_ref);
    let op_arg = ra.use_gpr(&mut args[1]);
    ra.asm.sub(result, op_arg);
}

pub fn emit_mul(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    // Multiplication commutes; keep the register operand destructive.
    let (a, b) = if args[0].is_immediate() { (1, 0) } else { (0, 1) };

    if args[b].is_immediate() {
        let imm = args[b].get_immediate_u32();
        ra.discard_use(&mut args[b]);
        let result = ra.use_def_gpr(&mut args[a], inst_ref);
        ra.asm.imul3(result.cvt32(), result.cvt32(), imm as i32);
    } else {
        let result = ra.use_def_gpr(&mut args[0], inst_ref);
        let op_arg = ra.use_gpr(&mut args[1]);
        ra.asm.imul(result.cvt32(), op_arg.cvt32());
    }
}

pub fn emit_mul64(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_gpr(&mut args[0], inst_ref);
    let op_arg = ra.use_gpr(&mut args[1]);
    ra.asm.imul(result, op_arg);
}

// ---------------------------------------------------------------------------
// Bitwise
// ---------------------------------------------------------------------------

enum BitOp {
    And,
    Or,
    Eor,
}

fn emit_bitop(ra: &mut RegAlloc, inst_ref: InstRef, inst: &Inst, op: BitOp) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_gpr(&mut args[0], inst_ref).cvt32();

    if args[1].is_immediate() {
        let imm = args[1].get_immediate_u32() as i32;
        match op {
            BitOp::And => ra.asm.and_(result, imm),
            BitOp::Or => ra.asm.or_(result, imm),
            BitOp::Eor => ra.asm.xor_(result, imm),
        }
    } else {
        let op_arg = ra.use_gpr(&mut args[1]).cvt32();
        match op {
            BitOp::And => ra.asm.and_(result, op_arg),
            BitOp::Or => ra.asm.or_(result, op_arg),
            BitOp::Eor => ra.asm.xor_(result, op_arg),
        }
    }
}

pub fn emit_and(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    emit_bitop(ra, inst_ref, inst, BitOp::And);
}

pub fn emit_or(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    emit_bitop(ra, inst_ref, inst, BitOp::Or);
}

pub fn emit_eor(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    emit_bitop(ra, inst_ref, inst, BitOp::Eor);
}

pub fn emit_not(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    if args[0].is_immediate() {
        let imm = !args[0].get_immediate_u32();
        ra.discard_use(&mut args[0]);
        let result = ra.def_gpr(inst_ref);
        ra.asm.mov(result.cvt32(), imm as i32);
    } else {
        let result = ra.use_def_gpr(&mut args[0], inst_ref);
        ra.asm.not_(result.cvt32());
    }
}

// ---------------------------------------------------------------------------
// Extensions
// ---------------------------------------------------------------------------

pub fn emit_sign_extend_word_to_long(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_gpr(&mut args[0], inst_ref);
    ra.asm.movsxd(result, result.cvt32());
}

pub fn emit_sign_extend_half_to_word(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_gpr(&mut args[0], inst_ref);
    ra.asm.movsx(result.cvt32(), result.cvt16());
}

pub fn emit_sign_extend_byte_to_word(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_gpr(&mut args[0], inst_ref);
    ra.asm.movsx(result.cvt32(), result.cvt8());
}

pub fn emit_zero_extend_word_to_long(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_gpr(&mut args[0], inst_ref);
    ra.asm.mov(result.cvt32(), result.cvt32());
}

pub fn emit_zero_extend_half_to_word(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_gpr(&mut args[0], inst_ref);
    ra.asm.movzx(result.cvt32(), result.cvt16());
}

pub fn emit_zero_extend_byte_to_word(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_gpr(&mut args[0], inst_ref);
    ra.asm.movzx(result.cvt32(), result.cvt8());
}

// ---------------------------------------------------------------------------
// Byte reversal and CLZ
// ---------------------------------------------------------------------------

pub fn emit_byte_reverse_word(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_gpr(&mut args[0], inst_ref);
    ra.asm.bswap(result.cvt32());
}

pub fn emit_byte_reverse_half(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_gpr(&mut args[0], inst_ref);
    ra.asm.rol(result.cvt16(), 8);
}

pub fn emit_byte_reverse_dual(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let result = ra.use_def_gpr(&mut args[0], inst_ref);
    ra.asm.bswap(result);
}

pub fn emit_count_leading_zeros(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);

    if ctx.cpu.lzcnt {
        let source = ra.use_gpr(&mut args[0]).cvt32();
        let result = ra.def_gpr(inst_ref).cvt32();
        ra.asm.lzcnt(result, source);
    } else {
        let source = ra.use_scratch_gpr(&mut args[0]).cvt32();
        let result = ra.def_gpr(inst_ref).cvt32();

        // BSR leaves the destination undefined for a zero input; patch that
        // case up to produce 32.
        ra.asm.bsr(result, source);
        ra.asm.mov(source, 0xFFFF_FFFFu32 as i32);
        ra.asm.cmovz(result, source);
        ra.asm.neg(result);
        ra.asm.add(result, 31i32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::location::LocationDescriptor;
    use crate::ir::value::Value;

    #[test]
    fn test_take_pseudo_op_adjusts_counts() {
        let mut block = Block::new(LocationDescriptor::at(0));
        let a = block.append(Opcode::GetRegister, &[Value::ImmRegRef(crate::arm::Reg::R0)]);
        let shift = block.append(
            Opcode::LogicalShiftLeft,
            &[Value::Inst(a), Value::ImmU8(4), Value::ImmU1(false)],
        );
        let carry = block.append(Opcode::GetCarryFromOp, &[Value::Inst(shift)]);
        block.append(Opcode::SetCFlag, &[Value::Inst(carry)]);
        block.append(
            Opcode::SetRegister,
            &[Value::ImmRegRef(crate::arm::Reg::R0), Value::Inst(shift)],
        );

        // shift is consumed by the carry pseudo-op and by SetRegister.
        assert_eq!(block.get(shift).use_count, 2);

        let mut asm = crate::backend::x64::assembler::CodeAssembler::new(4096).unwrap();
        let mut ra = RegAlloc::new(&mut asm, &block);
        let taken = take_pseudo_op(&mut block, &mut ra, shift, Opcode::GetCarryFromOp);
        assert_eq!(taken, Some(carry));
        assert!(block.get(carry).is_tombstone());
        // A second lookup finds nothing.
        assert_eq!(block.associated_pseudo_op(shift, Opcode::GetCarryFromOp), None);
    }
}
