//! Condition prelude, terminal lowering, block linking and patch sites.

use crate::backend::x64::assembler::{
    byte_ptr, dword_ptr, qword_ptr, Cc, CodeAssembler, Label, RegExp, EAX, EBX, ECX, ESI, RAX,
    RCX, R15,
};
use crate::backend::x64::emit_context::EmitContext;
use crate::backend::x64::hostloc::HOST_RCX;
use crate::backend::x64::jit_state::{JitState, RSB_PTR_MASK, RSB_SIZE};
use crate::backend::x64::patch_info::{PatchType, PATCH_JG_SIZE, PATCH_JMP_SIZE, PATCH_MOV_RCX_SIZE};
use crate::backend::x64::reg_alloc::RegAlloc;
use crate::ir::block::Block;
use crate::ir::cond::Cond;
use crate::ir::inst::Inst;
use crate::ir::location::{LocationDescriptor, CPSR_E_BIT, CPSR_T_BIT};
use crate::ir::terminal::Terminal;
use crate::ir::value::InstRef;

const N_MASK: u32 = 1 << 31;
const Z_MASK: u32 = 1 << 30;
const C_MASK: u32 = 1 << 29;
const V_MASK: u32 = 1 << 28;

fn cpsr() -> crate::backend::x64::assembler::Address {
    dword_ptr(RegExp::from(R15) + JitState::offset_of_cpsr() as i32)
}

fn pc() -> crate::backend::x64::assembler::Address {
    dword_ptr(RegExp::from(R15) + JitState::reg_offset(15) as i32)
}

/// Charge guest cycles against the budget.
pub fn emit_add_cycles(asm: &mut CodeAssembler, cycles: u64) {
    assert!(cycles < i32::MAX as u64);
    if cycles == 0 {
        return;
    }
    asm.sub(
        qword_ptr(RegExp::from(R15) + JitState::offset_of_cycles_remaining() as i32),
        cycles as i32,
    );
}

/// Test the CPSR against an ARM condition; the returned label is jumped to
/// when the condition PASSES. Clobbers EAX (and EBX/ESI for GT/LE).
pub fn emit_cond(asm: &mut CodeAssembler, cond: Cond) -> Label {
    let label = asm.create_label();

    asm.mov(EAX, cpsr());

    match cond {
        Cond::EQ => {
            asm.test(EAX, Z_MASK as i32);
            asm.jnz(&label);
        }
        Cond::NE => {
            asm.test(EAX, Z_MASK as i32);
            asm.jz(&label);
        }
        Cond::CS => {
            asm.test(EAX, C_MASK as i32);
            asm.jnz(&label);
        }
        Cond::CC => {
            asm.test(EAX, C_MASK as i32);
            asm.jz(&label);
        }
        Cond::MI => {
            asm.test(EAX, N_MASK as i32);
            asm.jnz(&label);
        }
        Cond::PL => {
            asm.test(EAX, N_MASK as i32);
            asm.jz(&label);
        }
        Cond::VS => {
            asm.test(EAX, V_MASK as i32);
            asm.jnz(&label);
        }
        Cond::VC => {
            asm.test(EAX, V_MASK as i32);
            asm.jz(&label);
        }
        Cond::HI => {
            asm.and_(EAX, (Z_MASK | C_MASK) as i32);
            asm.cmp(EAX, C_MASK as i32);
            asm.je(&label);
        }
        Cond::LS => {
            asm.and_(EAX, (Z_MASK | C_MASK) as i32);
            asm.cmp(EAX, C_MASK as i32);
            asm.jne(&label);
        }
        Cond::GE => {
            asm.and_(EAX, (N_MASK | V_MASK) as i32);
            asm.jz(&label);
            asm.cmp(EAX, (N_MASK | V_MASK) as i32);
            asm.je(&label);
        }
        Cond::LT => {
            let fail = asm.create_label();
            asm.and_(EAX, (N_MASK | V_MASK) as i32);
            asm.jz(&fail);
            asm.cmp(EAX, (N_MASK | V_MASK) as i32);
            asm.jne(&label);
            asm.bind(&fail);
        }
        Cond::GT => {
            asm.mov(EBX, EAX);
            asm.mov(ESI, EAX);
            asm.shr(EBX, 31);
            asm.shr(ESI, 28);
            asm.shr(EAX, 30);
            asm.xor_(EBX, ESI);
            asm.or_(EBX, EAX);
            asm.test(EBX, 1i32);
            asm.jz(&label);
        }
        Cond::LE => {
            asm.mov(EBX, EAX);
            asm.mov(ESI, EAX);
            asm.shr(EBX, 31);
            asm.shr(ESI, 28);
            asm.shr(EAX, 30);
            asm.xor_(EBX, ESI);
            asm.or_(EBX, EAX);
            asm.test(EBX, 1i32);
            asm.jnz(&label);
        }
        Cond::AL | Cond::NV => panic!("Unconditional blocks have no prelude"),
    }

    label
}

/// Emit the predicate prelude: when the block's condition fails, charge the
/// failure cycles and link to the fallthrough block.
pub fn emit_cond_prelude(ctx: &EmitContext, asm: &mut CodeAssembler, block: &Block) {
    if block.cond == Cond::AL || block.cond == Cond::NV {
        assert!(block.cond_failed_location.is_none());
        return;
    }

    let failed_location = block
        .cond_failed_location
        .expect("Conditional block without a fallthrough location");

    let pass = emit_cond(asm, block.cond);
    emit_add_cycles(asm, block.cond_failed_cycle_count);
    emit_terminal(
        ctx,
        asm,
        &Terminal::LinkBlock { next: failed_location },
        block.location,
    );
    asm.bind(&pass);
}

// ---------------------------------------------------------------------------
// Patch-site emitters. Each writes exactly its contracted size.
// ---------------------------------------------------------------------------

pub fn emit_patch_jg(asm: &mut CodeAssembler, target_offset: Option<usize>) {
    let start = asm.size();
    if let Some(target) = target_offset {
        asm.j_cc_offset(Cc::G, target);
    }
    asm.ensure_patch_location_size(start, PATCH_JG_SIZE);
}

pub fn emit_patch_jmp(
    asm: &mut CodeAssembler,
    target_pc: u32,
    target_offset: Option<usize>,
    return_from_run_code: usize,
) {
    let start = asm.size();
    match target_offset {
        Some(target) => asm.jmp_offset(target),
        None => {
            asm.mov(pc(), target_pc as i32);
            asm.jmp_offset(return_from_run_code);
        }
    }
    asm.ensure_patch_location_size(start, PATCH_JMP_SIZE);
}

pub fn emit_patch_mov_rcx(asm: &mut CodeAssembler, target_address: u64) {
    let start = asm.size();
    asm.mov_abs64(RCX, target_address);
    asm.ensure_patch_location_size(start, PATCH_MOV_RCX_SIZE);
}

// ---------------------------------------------------------------------------
// PushRSB (an ordinary IR opcode, but it owns a patch site)
// ---------------------------------------------------------------------------

/// Push `(unique_hash, code_ptr)` of the expected return target into the
/// RSB ring, unless the hash is already present.
pub fn emit_push_rsb(ctx: &EmitContext, ra: &mut RegAlloc, _block: &mut Block, _inst_ref: InstRef, inst: &Inst) {
    assert!(inst.args[0].is_immediate(), "PushRSB target must be a constant hash");
    let target_hash = inst.args[0].get_u64();

    let target_address = match ctx.target_code_offset(target_hash) {
        Some(offset) => ctx.code_base as u64 + offset as u64,
        None => ctx.return_from_run_code_address(),
    };

    let code_ptr_reg = ra.scratch_gpr_at(HOST_RCX);
    let loc_desc_reg = ra.scratch_gpr();
    let index_reg = ra.scratch_gpr().cvt32();

    let rsb_ptr_off = JitState::offset_of_rsb_ptr() as i32;
    let rsb_loc_off = JitState::offset_of_rsb_location_descriptors() as i32;
    let rsb_code_off = JitState::offset_of_rsb_codeptrs() as i32;

    ra.asm.mov(index_reg, dword_ptr(RegExp::from(R15) + rsb_ptr_off));
    ra.asm.add(index_reg, 1i32);
    ra.asm.and_(index_reg, RSB_PTR_MASK as i32);

    ra.asm.mov(loc_desc_reg, target_hash as i64);

    ctx.add_patch(target_hash, PatchType::MovRcx, ra.asm.size());
    emit_patch_mov_rcx(ra.asm, target_address);

    let skip = ra.asm.create_label();
    for i in 0..RSB_SIZE {
        ra.asm.cmp(
            loc_desc_reg,
            qword_ptr(RegExp::from(R15) + rsb_loc_off + (i * 8) as i32),
        );
        ra.asm.je(&skip);
    }

    ra.asm.mov(dword_ptr(RegExp::from(R15) + rsb_ptr_off), index_reg);
    ra.asm.mov(
        qword_ptr(RegExp::from(R15) + index_reg.cvt64() * 8u8 + rsb_loc_off),
        loc_desc_reg,
    );
    ra.asm.mov(
        qword_ptr(RegExp::from(R15) + index_reg.cvt64() * 8u8 + rsb_code_off),
        code_ptr_reg,
    );
    ra.asm.bind(&skip);
}

// ---------------------------------------------------------------------------
// Terminals
// ---------------------------------------------------------------------------

pub fn emit_terminal(
    ctx: &EmitContext,
    asm: &mut CodeAssembler,
    terminal: &Terminal,
    initial_location: LocationDescriptor,
) {
    match terminal {
        Terminal::Invalid => panic!("Block terminal was never set"),

        Terminal::Interpret { next } => emit_terminal_interpret(ctx, asm, *next, initial_location),

        Terminal::ReturnToDispatch => {
            asm.jmp_offset(ctx.trampolines.return_from_run_code);
        }

        Terminal::LinkBlock { next } => emit_terminal_link_block(ctx, asm, *next, initial_location),

        Terminal::LinkBlockFast { next } => {
            emit_terminal_link_block_fast(ctx, asm, *next, initial_location)
        }

        Terminal::PopRSBHint => emit_terminal_pop_rsb_hint(ctx, asm),

        Terminal::If { cond, then_, else_ } => match cond {
            Cond::AL | Cond::NV => emit_terminal(ctx, asm, then_, initial_location),
            _ => {
                let pass = emit_cond(asm, *cond);
                emit_terminal(ctx, asm, else_, initial_location);
                asm.bind(&pass);
                emit_terminal(ctx, asm, then_, initial_location);
            }
        },

        Terminal::CheckHalt { else_ } => {
            asm.cmp(
                byte_ptr(RegExp::from(R15) + JitState::offset_of_halt_requested() as i32),
                0i32,
            );
            asm.j_cc_offset(Cc::Nz, ctx.trampolines.return_from_run_code);
            emit_terminal(ctx, asm, else_, initial_location);
        }
    }
}

fn emit_terminal_interpret(
    ctx: &EmitContext,
    asm: &mut CodeAssembler,
    next: LocationDescriptor,
    initial_location: LocationDescriptor,
) {
    assert_eq!(next.t_flag(), initial_location.t_flag(), "Interworking interpret is unimplemented");
    assert_eq!(next.e_flag(), initial_location.e_flag(), "Endianness-changing interpret is unimplemented");

    asm.mov(pc(), next.pc() as i32);
    crate::backend::x64::block_of_code::BlockOfCode::emit_switch_mxcsr_on_exit(asm);
    let jit_ptr = ctx.config.jit_ptr;
    let user_arg = ctx.config.user_arg;
    let next_pc = next.pc();
    ctx.config.callbacks.interpreter_fallback.emit_call(asm, &|code, params| {
        code.mov(params[0].cvt32(), next_pc as i32);
        code.mov(params[1], jit_ptr as i64);
        code.mov(params[2], user_arg as i64);
    });
    asm.jmp_offset(ctx.trampolines.return_from_run_code_no_mxcsr);
}

/// Adjust CPSR.T/CPSR.E when the successor runs in a different decode state.
fn emit_te_fixup(asm: &mut CodeAssembler, next: LocationDescriptor, initial: LocationDescriptor) {
    if next.t_flag() != initial.t_flag() {
        if next.t_flag() {
            asm.or_(cpsr(), CPSR_T_BIT as i32);
        } else {
            asm.and_(cpsr(), !CPSR_T_BIT as i32);
        }
    }
    if next.e_flag() != initial.e_flag() {
        if next.e_flag() {
            asm.or_(cpsr(), CPSR_E_BIT as i32);
        } else {
            asm.and_(cpsr(), !CPSR_E_BIT as i32);
        }
    }
}

fn emit_terminal_link_block(
    ctx: &EmitContext,
    asm: &mut CodeAssembler,
    next: LocationDescriptor,
    initial_location: LocationDescriptor,
) {
    emit_te_fixup(asm, next, initial_location);

    asm.cmp(
        qword_ptr(RegExp::from(R15) + JitState::offset_of_cycles_remaining() as i32),
        0i32,
    );

    ctx.add_patch(next.unique_hash(), PatchType::Jg, asm.size());
    emit_patch_jg(asm, ctx.target_code_offset(next.unique_hash()));

    asm.mov(pc(), next.pc() as i32);
    asm.jmp_offset(ctx.trampolines.return_from_run_code);
}

fn emit_terminal_link_block_fast(
    ctx: &EmitContext,
    asm: &mut CodeAssembler,
    next: LocationDescriptor,
    initial_location: LocationDescriptor,
) {
    emit_te_fixup(asm, next, initial_location);

    ctx.add_patch(next.unique_hash(), PatchType::Jmp, asm.size());
    emit_patch_jmp(
        asm,
        next.pc(),
        ctx.target_code_offset(next.unique_hash()),
        ctx.trampolines.return_from_run_code,
    );
}

/// Recompute the current location hash from guest state and jump to the
/// matching RSB entry, or to the dispatcher on a miss.
///
/// The hash layout must match `LocationDescriptor::unique_hash` and the
/// value pushed by `PushRSB`.
fn emit_terminal_pop_rsb_hint(ctx: &EmitContext, asm: &mut CodeAssembler) {
    asm.mov(EBX, cpsr());
    asm.mov(ECX, pc());
    asm.and_(EBX, (CPSR_T_BIT | CPSR_E_BIT) as i32);
    asm.shr(EBX, 2);
    asm.or_(
        EBX,
        dword_ptr(RegExp::from(R15) + JitState::offset_of_fpscr_mode() as i32),
    );
    asm.shl(EBX.cvt64(), 32);
    asm.or_(EBX.cvt64(), ECX.cvt64());

    asm.mov_abs64(RAX, ctx.return_from_run_code_address());
    let rsb_loc_off = JitState::offset_of_rsb_location_descriptors() as i32;
    let rsb_code_off = JitState::offset_of_rsb_codeptrs() as i32;
    for i in 0..RSB_SIZE {
        asm.cmp(
            EBX.cvt64(),
            qword_ptr(RegExp::from(R15) + rsb_loc_off + (i * 8) as i32),
        );
        asm.cmove(
            RAX,
            qword_ptr(RegExp::from(R15) + rsb_code_off + (i * 8) as i32),
        );
    }
    asm.jmp_reg(RAX);
}
