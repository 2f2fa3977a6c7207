//! Lowerings for guest-state access: registers, CPSR flags, GE bits,
//! FPSCR, BXWritePC and the supervisor call.

use crate::backend::x64::assembler::{dword_ptr, qword_ptr, CodeAssembler, Reg, RegExp, R15, RSI};
use crate::backend::x64::block_of_code::BlockOfCode;
use crate::backend::x64::emit_context::EmitContext;
use crate::backend::x64::jit_state::JitState;
use crate::backend::x64::reg_alloc::RegAlloc;
use crate::ir::block::Block;
use crate::ir::inst::Inst;
use crate::ir::value::InstRef;

fn state_reg(index: usize) -> crate::backend::x64::assembler::Address {
    dword_ptr(RegExp::from(R15) + JitState::reg_offset(index) as i32)
}

fn cpsr() -> crate::backend::x64::assembler::Address {
    dword_ptr(RegExp::from(R15) + JitState::offset_of_cpsr() as i32)
}

fn ext_reg(backing_index: usize, double: bool) -> crate::backend::x64::assembler::Address {
    let offset = JitState::ext_reg_offset(backing_index) as i32;
    if double {
        qword_ptr(RegExp::from(R15) + offset)
    } else {
        dword_ptr(RegExp::from(R15) + offset)
    }
}

/// Forward arguments that `host_call` placed in ABI parameter registers into
/// the (possibly shifted) parameter set a callback exposes. Copies run from
/// the last argument down so no pending source is clobbered.
pub fn forward_abi_args(code: &mut CodeAssembler, params: &[Reg], used: usize) {
    use crate::backend::x64::abi::ABI_PARAMS;
    for i in (0..used).rev() {
        if params[i].get_idx() != ABI_PARAMS[i].to_reg64().get_idx() {
            code.mov(params[i], ABI_PARAMS[i].to_reg64());
        }
    }
}

// ---------------------------------------------------------------------------
// General-purpose registers
// ---------------------------------------------------------------------------

pub fn emit_get_register(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let reg = inst.args[0].get_reg_ref();
    let result = ra.def_gpr(inst_ref);
    ra.asm.mov(result.cvt32(), state_reg(reg.number()));
}

pub fn emit_set_register(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, _inst_ref: InstRef, inst: &Inst) {
    let reg = inst.args[0].get_reg_ref();
    let mut args = ra.get_argument_info(inst);
    if args[1].is_immediate() {
        let imm = args[1].get_immediate_u32();
        ra.asm.mov(state_reg(reg.number()), imm as i32);
    } else {
        let to_store = ra.use_gpr(&mut args[1]);
        ra.asm.mov(state_reg(reg.number()), to_store.cvt32());
    }
}

// ---------------------------------------------------------------------------
// Extension registers
// ---------------------------------------------------------------------------

pub fn emit_get_extended_register32(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let reg = inst.args[0].get_ext_reg_ref();
    assert!(reg.is_single());
    let result = ra.def_xmm(inst_ref);
    ra.asm.movss(result, ext_reg(reg.backing_index(), false));
}

pub fn emit_set_extended_register32(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, _inst_ref: InstRef, inst: &Inst) {
    let reg = inst.args[0].get_ext_reg_ref();
    assert!(reg.is_single());
    let mut args = ra.get_argument_info(inst);
    let source = ra.use_xmm(&mut args[1]);
    ra.asm.movss(ext_reg(reg.backing_index(), false), source);
}

pub fn emit_get_extended_register64(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let reg = inst.args[0].get_ext_reg_ref();
    assert!(reg.is_double());
    let result = ra.def_xmm(inst_ref);
    ra.asm.movsd(result, ext_reg(reg.backing_index(), true));
}

pub fn emit_set_extended_register64(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, _inst_ref: InstRef, inst: &Inst) {
    let reg = inst.args[0].get_ext_reg_ref();
    assert!(reg.is_double());
    let mut args = ra.get_argument_info(inst);
    let source = ra.use_xmm(&mut args[1]);
    ra.asm.movsd(ext_reg(reg.backing_index(), true), source);
}

// ---------------------------------------------------------------------------
// CPSR and flags
// ---------------------------------------------------------------------------

pub fn emit_get_cpsr(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, _inst: &Inst) {
    let result = ra.def_gpr(inst_ref);
    ra.asm.mov(result.cvt32(), cpsr());
}

pub fn emit_set_cpsr(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, _inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let arg = ra.use_gpr(&mut args[0]);
    ra.asm.mov(cpsr(), arg.cvt32());
}

fn emit_get_flag(ra: &mut RegAlloc, inst_ref: InstRef, flag_bit: u32) {
    let result = ra.def_gpr(inst_ref);
    ra.asm.mov(result.cvt32(), cpsr());
    ra.asm.shr(result.cvt32(), flag_bit as u8);
    if flag_bit != 31 {
        ra.asm.and_(result.cvt32(), 1i32);
    }
}

fn emit_set_flag(ra: &mut RegAlloc, inst: &Inst, flag_bit: u32) {
    let flag_mask = 1u32 << flag_bit;
    let mut args = ra.get_argument_info(inst);
    if args[0].is_immediate() {
        if args[0].get_immediate_u1() {
            ra.asm.or_(cpsr(), flag_mask as i32);
        } else {
            ra.asm.and_(cpsr(), !flag_mask as i32);
        }
    } else {
        let to_store = ra.use_scratch_gpr(&mut args[0]);
        ra.asm.shl(to_store.cvt32(), flag_bit as u8);
        ra.asm.and_(cpsr(), !flag_mask as i32);
        ra.asm.or_(cpsr(), to_store.cvt32());
    }
}

pub fn emit_get_n_flag(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, _inst: &Inst) {
    emit_get_flag(ra, inst_ref, 31);
}

pub fn emit_set_n_flag(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, _inst_ref: InstRef, inst: &Inst) {
    emit_set_flag(ra, inst, 31);
}

pub fn emit_get_z_flag(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, _inst: &Inst) {
    emit_get_flag(ra, inst_ref, 30);
}

pub fn emit_set_z_flag(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, _inst_ref: InstRef, inst: &Inst) {
    emit_set_flag(ra, inst, 30);
}

pub fn emit_get_c_flag(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, _inst: &Inst) {
    emit_get_flag(ra, inst_ref, 29);
}

pub fn emit_set_c_flag(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, _inst_ref: InstRef, inst: &Inst) {
    emit_set_flag(ra, inst, 29);
}

pub fn emit_get_v_flag(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, _inst: &Inst) {
    emit_get_flag(ra, inst_ref, 28);
}

pub fn emit_set_v_flag(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, _inst_ref: InstRef, inst: &Inst) {
    emit_set_flag(ra, inst, 28);
}

pub fn emit_or_q_flag(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, _inst_ref: InstRef, inst: &Inst) {
    const Q_BIT: u32 = 27;
    let mut args = ra.get_argument_info(inst);
    if args[0].is_immediate() {
        if args[0].get_immediate_u1() {
            ra.asm.or_(cpsr(), (1u32 << Q_BIT) as i32);
        }
    } else {
        let to_store = ra.use_scratch_gpr(&mut args[0]);
        ra.asm.shl(to_store.cvt32(), Q_BIT as u8);
        ra.asm.or_(cpsr(), to_store.cvt32());
    }
}

// ---------------------------------------------------------------------------
// GE flags (CPSR bits 19..16)
// ---------------------------------------------------------------------------

pub fn emit_get_ge_flags(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, _inst: &Inst) {
    let result = ra.def_gpr(inst_ref);
    ra.asm.mov(result.cvt32(), cpsr());
    ra.asm.shr(result.cvt32(), 16);
    ra.asm.and_(result.cvt32(), 0xFi32);
}

pub fn emit_set_ge_flags(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, _inst_ref: InstRef, inst: &Inst) {
    const FLAG_MASK: u32 = 0xF << 16;
    let mut args = ra.get_argument_info(inst);
    if args[0].is_immediate() {
        let imm = (args[0].get_immediate_u32() << 16) & FLAG_MASK;
        ra.asm.and_(cpsr(), !FLAG_MASK as i32);
        ra.asm.or_(cpsr(), imm as i32);
    } else {
        let to_store = ra.use_scratch_gpr(&mut args[0]);
        ra.asm.shl(to_store.cvt32(), 16);
        ra.asm.and_(to_store.cvt32(), FLAG_MASK as i32);
        ra.asm.and_(cpsr(), !FLAG_MASK as i32);
        ra.asm.or_(cpsr(), to_store.cvt32());
    }
}

// ---------------------------------------------------------------------------
// BXWritePC
// ---------------------------------------------------------------------------

/// Write PC and CPSR.T together: bit 0 of the target selects Thumb and the
/// PC is aligned accordingly. The variable path is branchless.
pub fn emit_bx_write_pc(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, _inst_ref: InstRef, inst: &Inst) {
    const T_BIT: u32 = 1 << 5;
    let mut args = ra.get_argument_info(inst);

    if args[0].is_immediate() {
        let new_pc = args[0].get_immediate_u32();
        if new_pc & 1 != 0 {
            ra.asm.mov(state_reg(15), (new_pc & 0xFFFF_FFFE) as i32);
            ra.asm.or_(cpsr(), T_BIT as i32);
        } else {
            ra.asm.mov(state_reg(15), (new_pc & 0xFFFF_FFFC) as i32);
            ra.asm.and_(cpsr(), !T_BIT as i32);
        }
    } else {
        let new_pc = ra.use_scratch_gpr(&mut args[0]);
        let tmp1 = ra.scratch_gpr();
        let tmp2 = ra.scratch_gpr();

        ra.asm.mov(tmp1.cvt32(), cpsr());
        ra.asm.mov(tmp2.cvt32(), tmp1.cvt32());
        ra.asm.and_(tmp2.cvt32(), !T_BIT as i32);
        ra.asm.or_(tmp1.cvt32(), T_BIT as i32);
        ra.asm.test(new_pc.cvt32(), 1i32);
        ra.asm.cmove(tmp1.cvt32(), tmp2.cvt32());
        ra.asm.mov(cpsr(), tmp1.cvt32());

        // mask = pc & 1 ? 0xFFFFFFFE : 0xFFFFFFFC
        ra.asm.lea(tmp2, qword_ptr(RegExp::from(new_pc) + new_pc * 1u8));
        ra.asm.or_(tmp2, 0xFFFF_FFFCu32 as i32);
        ra.asm.and_(new_pc, tmp2);
        ra.asm.mov(state_reg(15), new_pc.cvt32());
    }
}

// ---------------------------------------------------------------------------
// Supervisor call and FPSCR
// ---------------------------------------------------------------------------

pub fn emit_call_supervisor(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, _inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let [a0, ..] = &mut args;
    ra.host_call(None, [Some(a0), None, None, None]);

    BlockOfCode::emit_switch_mxcsr_on_exit(ra.asm);
    ctx.config.callbacks.call_svc.emit_call(ra.asm, &|code, params| {
        forward_abi_args(code, params, 1);
    });
    BlockOfCode::emit_switch_mxcsr_on_entry(ra.asm);
}

extern "sysv64" fn get_fpscr_impl(jit_state: *mut JitState) -> u32 {
    unsafe { (*jit_state).fpscr() }
}

extern "sysv64" fn set_fpscr_impl(value: u32, jit_state: *mut JitState) {
    unsafe { (*jit_state).set_fpscr(value) }
}

pub fn emit_get_fpscr(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, _inst: &Inst) {
    ra.host_call(Some(inst_ref), [None, None, None, None]);
    let param1 = crate::backend::x64::abi::ABI_PARAMS[0].to_reg64();
    ra.asm.mov(param1, R15);

    BlockOfCode::emit_switch_mxcsr_on_exit(ra.asm);
    BlockOfCode::emit_call_function(ra.asm, get_fpscr_impl as usize as u64);
    BlockOfCode::emit_switch_mxcsr_on_entry(ra.asm);
}

pub fn emit_set_fpscr(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, _inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let [a0, ..] = &mut args;
    ra.host_call(None, [Some(a0), None, None, None]);
    ra.asm.mov(RSI, R15);

    BlockOfCode::emit_switch_mxcsr_on_exit(ra.asm);
    BlockOfCode::emit_call_function(ra.asm, set_fpscr_impl as usize as u64);
    BlockOfCode::emit_switch_mxcsr_on_entry(ra.asm);
}

pub fn emit_get_fpscr_nzcv(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, _inst: &Inst) {
    let result = ra.def_gpr(inst_ref);
    ra.asm.mov(
        result.cvt32(),
        dword_ptr(RegExp::from(R15) + JitState::offset_of_fpscr_nzcv() as i32),
    );
}

pub fn emit_set_fpscr_nzcv(_ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, _inst_ref: InstRef, inst: &Inst) {
    let mut args = ra.get_argument_info(inst);
    let value = ra.use_gpr(&mut args[0]);
    ra.asm.mov(
        dword_ptr(RegExp::from(R15) + JitState::offset_of_fpscr_nzcv() as i32),
        value.cvt32(),
    );
}
