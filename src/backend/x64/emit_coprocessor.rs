//! Lowerings for coprocessor opcodes.
//!
//! Each decodes its packed `CoprocInfo`, asks the registered coprocessor to
//! compile the operation, and emits one of three outcomes: a guest
//! undefined-instruction fault (host trap), a host callback, or direct
//! moves against a memory cell the coprocessor exposes.

use std::rc::Rc;

use tracing::debug;

use crate::arm::CoprocReg;
use crate::backend::x64::assembler::dword_ptr;
use crate::backend::x64::assembler::RegExp;
use crate::backend::x64::block_of_code::BlockOfCode;
use crate::backend::x64::emit_context::EmitContext;
use crate::backend::x64::reg_alloc::{Argument, RegAlloc};
use crate::coprocessor::{CoprocAction, CoprocCallback, Coprocessor};
use crate::ir::block::Block;
use crate::ir::inst::Inst;
use crate::ir::value::InstRef;

/// Undefined coprocessor access: trap so the host can surface the guest
/// fault. The operands are still consumed to keep the allocator balanced.
fn emit_coprocessor_exception(ra: &mut RegAlloc, args: &mut [Argument], num_args: usize) {
    debug!("undefined coprocessor access compiled to a trap");
    for arg in args.iter_mut().take(num_args) {
        ra.discard_use(arg);
    }
    ra.asm.int3();
}

/// Call `(jit, user_arg?, operand0?, operand1?)` in the host convention.
fn call_coproc_callback(
    ctx: &EmitContext,
    ra: &mut RegAlloc,
    callback: CoprocCallback,
    result_def: Option<InstRef>,
    args: [Option<&mut Argument>; 2],
) {
    let [arg0, arg1] = args;
    ra.host_call(result_def, [None, None, arg0, arg1]);

    let param1 = crate::backend::x64::abi::ABI_PARAMS[0].to_reg64();
    let param2 = crate::backend::x64::abi::ABI_PARAMS[1].to_reg64();
    ra.asm.mov(param1, ctx.config.jit_ptr as i64);
    if let Some(user_arg) = callback.user_arg {
        ra.asm.mov(param2, user_arg as i64);
    }
    BlockOfCode::emit_call_function(ra.asm, callback.function);
}

fn coprocessor(ctx: &EmitContext, num: u8) -> Option<Rc<dyn Coprocessor>> {
    ctx.config.coprocessors[num as usize].clone()
}

pub fn emit_coproc_internal_operation(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, _inst_ref: InstRef, inst: &Inst) {
    let info = inst.args[0].get_coproc_info();
    let mut args = ra.get_argument_info(inst);

    let two = info[1] != 0;
    let opc1 = info[2] as u32;
    let crd = CoprocReg::from_u8(info[3]);
    let crn = CoprocReg::from_u8(info[4]);
    let crm = CoprocReg::from_u8(info[5]);
    let opc2 = info[6] as u32;

    let action = coprocessor(ctx, info[0])
        .and_then(|c| c.compile_internal_operation(two, opc1, crd, crn, crm, opc2));
    match action {
        None => emit_coprocessor_exception(ra, &mut args, inst.num_args()),
        Some(callback) => {
            ra.discard_use(&mut args[0]);
            call_coproc_callback(ctx, ra, callback, None, [None, None]);
        }
    }
}

pub fn emit_coproc_send_one_word(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, _inst_ref: InstRef, inst: &Inst) {
    let info = inst.args[0].get_coproc_info();
    let mut args = ra.get_argument_info(inst);

    let two = info[1] != 0;
    let opc1 = info[2] as u32;
    let crn = CoprocReg::from_u8(info[3]);
    let crm = CoprocReg::from_u8(info[4]);
    let opc2 = info[5] as u32;

    let action = coprocessor(ctx, info[0])
        .and_then(|c| c.compile_send_one_word(two, opc1, crn, crm, opc2));
    match action {
        None => emit_coprocessor_exception(ra, &mut args, inst.num_args()),
        Some(CoprocAction::Callback(callback)) => {
            let [a0, a1, ..] = &mut args;
            ra.discard_use(a0);
            call_coproc_callback(ctx, ra, callback, None, [Some(a1), None]);
        }
        Some(CoprocAction::OneCell(destination)) => {
            ra.discard_use(&mut args[0]);
            let word = ra.use_gpr(&mut args[1]);
            let addr = ra.scratch_gpr();
            ra.asm.mov_abs64(addr, destination as u64);
            ra.asm.mov(dword_ptr(RegExp::from(addr)), word.cvt32());
        }
        Some(CoprocAction::TwoCells(_)) => {
            panic!("Single-word coprocessor transfer compiled to two cells")
        }
    }
}

pub fn emit_coproc_send_two_words(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, _inst_ref: InstRef, inst: &Inst) {
    let info = inst.args[0].get_coproc_info();
    let mut args = ra.get_argument_info(inst);

    let two = info[1] != 0;
    let opc = info[2] as u32;
    let crm = CoprocReg::from_u8(info[3]);

    let action = coprocessor(ctx, info[0]).and_then(|c| c.compile_send_two_words(two, opc, crm));
    match action {
        None => emit_coprocessor_exception(ra, &mut args, inst.num_args()),
        Some(CoprocAction::Callback(callback)) => {
            let [a0, a1, a2, ..] = &mut args;
            ra.discard_use(a0);
            call_coproc_callback(ctx, ra, callback, None, [Some(a1), Some(a2)]);
        }
        Some(CoprocAction::TwoCells(destinations)) => {
            ra.discard_use(&mut args[0]);
            let word1 = ra.use_gpr(&mut args[1]);
            let word2 = ra.use_gpr(&mut args[2]);
            let addr = ra.scratch_gpr();
            ra.asm.mov_abs64(addr, destinations[0] as u64);
            ra.asm.mov(dword_ptr(RegExp::from(addr)), word1.cvt32());
            ra.asm.mov_abs64(addr, destinations[1] as u64);
            ra.asm.mov(dword_ptr(RegExp::from(addr)), word2.cvt32());
        }
        Some(CoprocAction::OneCell(_)) => {
            panic!("Two-word coprocessor transfer compiled to one cell")
        }
    }
}

pub fn emit_coproc_get_one_word(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let info = inst.args[0].get_coproc_info();
    let mut args = ra.get_argument_info(inst);

    let two = info[1] != 0;
    let opc1 = info[2] as u32;
    let crn = CoprocReg::from_u8(info[3]);
    let crm = CoprocReg::from_u8(info[4]);
    let opc2 = info[5] as u32;

    let action = coprocessor(ctx, info[0])
        .and_then(|c| c.compile_get_one_word(two, opc1, crn, crm, opc2));
    match action {
        None => emit_coprocessor_exception(ra, &mut args, inst.num_args()),
        Some(CoprocAction::Callback(callback)) => {
            ra.discard_use(&mut args[0]);
            call_coproc_callback(ctx, ra, callback, Some(inst_ref), [None, None]);
        }
        Some(CoprocAction::OneCell(source)) => {
            ra.discard_use(&mut args[0]);
            let word = ra.def_gpr(inst_ref);
            let addr = ra.scratch_gpr();
            ra.asm.mov_abs64(addr, source as u64);
            ra.asm.mov(word.cvt32(), dword_ptr(RegExp::from(addr)));
        }
        Some(CoprocAction::TwoCells(_)) => {
            panic!("Single-word coprocessor transfer compiled to two cells")
        }
    }
}

pub fn emit_coproc_get_two_words(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, inst_ref: InstRef, inst: &Inst) {
    let info = inst.args[0].get_coproc_info();
    let mut args = ra.get_argument_info(inst);

    let two = info[1] != 0;
    let opc = info[2] as u32;
    let crm = CoprocReg::from_u8(info[3]);

    let action = coprocessor(ctx, info[0]).and_then(|c| c.compile_get_two_words(two, opc, crm));
    match action {
        None => emit_coprocessor_exception(ra, &mut args, inst.num_args()),
        Some(CoprocAction::Callback(callback)) => {
            ra.discard_use(&mut args[0]);
            call_coproc_callback(ctx, ra, callback, Some(inst_ref), [None, None]);
        }
        Some(CoprocAction::TwoCells(sources)) => {
            ra.discard_use(&mut args[0]);
            let result = ra.def_gpr(inst_ref);
            let addr = ra.scratch_gpr();
            let tmp = ra.scratch_gpr();
            ra.asm.mov_abs64(addr, sources[1] as u64);
            ra.asm.mov(result.cvt32(), dword_ptr(RegExp::from(addr)));
            ra.asm.shl(result, 32);
            ra.asm.mov_abs64(addr, sources[0] as u64);
            ra.asm.mov(tmp.cvt32(), dword_ptr(RegExp::from(addr)));
            ra.asm.or_(result, tmp);
        }
        Some(CoprocAction::OneCell(_)) => {
            panic!("Two-word coprocessor transfer compiled to one cell")
        }
    }
}

pub fn emit_coproc_load_words(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, _inst_ref: InstRef, inst: &Inst) {
    let info = inst.args[0].get_coproc_info();
    let mut args = ra.get_argument_info(inst);

    let two = info[1] != 0;
    let long_transfer = info[2] != 0;
    let crd = CoprocReg::from_u8(info[3]);
    let option = (info[4] != 0).then_some(info[5]);

    let action = coprocessor(ctx, info[0])
        .and_then(|c| c.compile_load_words(two, long_transfer, crd, option));
    match action {
        None => emit_coprocessor_exception(ra, &mut args, inst.num_args()),
        Some(callback) => {
            let [a0, a1, ..] = &mut args;
            ra.discard_use(a0);
            call_coproc_callback(ctx, ra, callback, None, [Some(a1), None]);
        }
    }
}

pub fn emit_coproc_store_words(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, _inst_ref: InstRef, inst: &Inst) {
    let info = inst.args[0].get_coproc_info();
    let mut args = ra.get_argument_info(inst);

    let two = info[1] != 0;
    let long_transfer = info[2] != 0;
    let crd = CoprocReg::from_u8(info[3]);
    let option = (info[4] != 0).then_some(info[5]);

    let action = coprocessor(ctx, info[0])
        .and_then(|c| c.compile_store_words(two, long_transfer, crd, option));
    match action {
        None => emit_coprocessor_exception(ra, &mut args, inst.num_args()),
        Some(callback) => {
            let [a0, a1, ..] = &mut args;
            ra.discard_use(a0);
            call_coproc_callback(ctx, ra, callback, None, [Some(a1), None]);
        }
    }
}
