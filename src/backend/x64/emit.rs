//! Block emission: walks a block's instructions in lockstep with the
//! register allocator, dispatches each opcode to its lowering, brackets the
//! body with the condition prelude and the terminal, and maintains the
//! block registry and patch table.

use tracing::debug;

use crate::backend::x64::assembler::Result;
use crate::backend::x64::block_cache::{BlockDescriptor, BlockRegistry};
use crate::backend::x64::block_of_code::{BlockOfCode, RunCodeFn};
use crate::backend::x64::emit_context::EmitContext;
use crate::backend::x64::emit_coprocessor as coproc;
use crate::backend::x64::emit_data_processing as dp;
use crate::backend::x64::emit_floating_point as fp;
use crate::backend::x64::emit_memory as mem;
use crate::backend::x64::emit_packed as packed;
use crate::backend::x64::emit_saturation as sat;
use crate::backend::x64::emit_state as state;
use crate::backend::x64::emit_terminal as term;
use crate::backend::x64::patch_info::{PatchTable, PATCH_JG_SIZE, PATCH_JMP_SIZE};
use crate::backend::x64::reg_alloc::RegAlloc;
use crate::config::UserConfig;
use crate::ir::block::Block;
use crate::ir::location::LocationDescriptor;
use crate::ir::opcode::Opcode;
use crate::ir::value::InstRef;

/// The x86-64 back end: emits IR blocks into the code arena and keeps the
/// registry of emitted blocks and their pending link sites.
///
/// Owned by a single thread; never re-entered while a block is in flight.
pub struct EmitX64 {
    pub code: BlockOfCode,
    registry: BlockRegistry,
    patch_table: PatchTable,
    config: UserConfig,
}

impl EmitX64 {
    pub fn new(config: UserConfig) -> Result<Self> {
        let code = BlockOfCode::new(config.code_cache_size, &config.callbacks)?;
        Ok(Self {
            code,
            registry: BlockRegistry::new(),
            patch_table: PatchTable::new(),
            config,
        })
    }

    /// Entry point for the dispatcher: run emitted code starting at a block.
    pub fn run_code_fn(&self) -> RunCodeFn {
        self.code.run_code_fn()
    }

    pub fn get_block(&self, location: LocationDescriptor) -> Option<BlockDescriptor> {
        self.registry.get(location.unique_hash())
    }

    pub fn block_entrypoint(&self, descriptor: BlockDescriptor) -> *const u8 {
        unsafe { self.code.code_base_ptr().add(descriptor.entrypoint_offset) }
    }

    /// Lower one IR block to host code and resolve any pending links to it.
    pub fn emit(&mut self, block: &mut Block) -> BlockDescriptor {
        assert!(!block.terminal().is_invalid(), "Block terminal was never set");

        self.code.asm.align(16);
        let start = self.code.asm.size();

        let ctx = EmitContext::new(
            block.location,
            &self.config,
            &self.registry,
            self.code.consts,
            self.code.cpu,
            self.code.trampolines,
            self.code.asm.top(),
        );

        term::emit_cond_prelude(&ctx, &mut self.code.asm, block);

        {
            let mut ra = RegAlloc::new(&mut self.code.asm, block);
            for i in 0..block.inst_count() {
                let inst_ref = InstRef(i as u32);
                if block.get(inst_ref).is_tombstone() {
                    continue;
                }
                let inst = block.get(inst_ref).clone();
                emit_inst(&ctx, &mut ra, block, inst_ref, &inst);
                ra.end_of_alloc_scope();
            }
            ra.assert_no_more_uses();
        }

        term::emit_add_cycles(&mut self.code.asm, block.cycle_count);
        term::emit_terminal(&ctx, &mut self.code.asm, block.terminal(), block.location);
        self.code.asm.int3();

        let descriptor = BlockDescriptor {
            entrypoint_offset: start,
            size: self.code.asm.size() - start,
        };

        let patch_entries = ctx.take_patch_entries();
        drop(ctx);

        let hash = block.location.unique_hash();
        debug!(location = %block.location, offset = start, size = descriptor.size, "emitted block");

        for entry in patch_entries {
            let info = self.patch_table.entry(entry.target_hash).or_default();
            match entry.patch_type {
                crate::backend::x64::patch_info::PatchType::Jg => info.jg.push(entry.code_offset),
                crate::backend::x64::patch_info::PatchType::Jmp => info.jmp.push(entry.code_offset),
                crate::backend::x64::patch_info::PatchType::MovRcx => info.mov_rcx.push(entry.code_offset),
            }
        }

        self.registry.insert(hash, descriptor);
        self.patch(hash, Some(descriptor.entrypoint_offset));

        descriptor
    }

    /// Rewrite every link site referring to `target_hash`: into the block at
    /// `target_offset`, or back to its dispatcher-return form when `None`.
    fn patch(&mut self, target_hash: u64, target_offset: Option<usize>) {
        let info = match self.patch_table.get(&target_hash) {
            Some(info) => info.clone(),
            None => return,
        };
        let target_pc = target_hash as u32;
        let rfrc = self.code.trampolines.return_from_run_code;
        let saved_size = self.code.asm.size();

        for &site in &info.jg {
            self.code.asm.set_size(site);
            term::emit_patch_jg(&mut self.code.asm, target_offset);
            assert_eq!(self.code.asm.size() - site, PATCH_JG_SIZE);
        }
        for &site in &info.jmp {
            self.code.asm.set_size(site);
            term::emit_patch_jmp(&mut self.code.asm, target_pc, target_offset, rfrc);
            assert_eq!(self.code.asm.size() - site, PATCH_JMP_SIZE);
        }
        for &site in &info.mov_rcx {
            self.code.asm.set_size(site);
            let address = match target_offset {
                Some(offset) => self.code.code_base_ptr() as u64 + offset as u64,
                None => self.code.return_from_run_code_address(),
            };
            term::emit_patch_mov_rcx(&mut self.code.asm, address);
        }

        self.code.asm.set_size(saved_size);
    }

    /// Detach every link into `location`, restoring dispatcher-return stubs.
    /// Called by the outer system before discarding a block's code.
    pub fn unpatch(&mut self, location: LocationDescriptor) {
        self.patch(location.unique_hash(), None);
    }

    /// Drop registry entries whose guest PC overlaps `[start, start+length)`
    /// and unlink all jumps into them.
    pub fn invalidate_range(&mut self, start: u32, length: u32) {
        for hash in self.registry.hashes_in_range(start, length) {
            self.patch(hash, None);
            self.patch_table.remove(&hash);
            self.registry.remove(hash);
        }
    }

    /// Throw away all emitted code. The emitter must be quiescent.
    pub fn clear_cache(&mut self) {
        debug!("clearing block cache");
        self.registry.clear();
        self.patch_table.clear();
        self.code.clear_cache();
    }
}

/// Dispatch one IR instruction to its lowering.
fn emit_inst(ctx: &EmitContext, ra: &mut RegAlloc, block: &mut Block, inst_ref: InstRef, inst: &crate::ir::inst::Inst) {
    match inst.opcode {
        Opcode::Void => {}
        Opcode::Identity => dp::emit_identity(ctx, ra, block, inst_ref, inst),
        Opcode::Breakpoint => ra.asm.int3(),

        // Guest register and flag access
        Opcode::GetRegister => state::emit_get_register(ctx, ra, block, inst_ref, inst),
        Opcode::SetRegister => state::emit_set_register(ctx, ra, block, inst_ref, inst),
        Opcode::GetExtendedRegister32 => state::emit_get_extended_register32(ctx, ra, block, inst_ref, inst),
        Opcode::SetExtendedRegister32 => state::emit_set_extended_register32(ctx, ra, block, inst_ref, inst),
        Opcode::GetExtendedRegister64 => state::emit_get_extended_register64(ctx, ra, block, inst_ref, inst),
        Opcode::SetExtendedRegister64 => state::emit_set_extended_register64(ctx, ra, block, inst_ref, inst),
        Opcode::GetCpsr => state::emit_get_cpsr(ctx, ra, block, inst_ref, inst),
        Opcode::SetCpsr => state::emit_set_cpsr(ctx, ra, block, inst_ref, inst),
        Opcode::GetNFlag => state::emit_get_n_flag(ctx, ra, block, inst_ref, inst),
        Opcode::SetNFlag => state::emit_set_n_flag(ctx, ra, block, inst_ref, inst),
        Opcode::GetZFlag => state::emit_get_z_flag(ctx, ra, block, inst_ref, inst),
        Opcode::SetZFlag => state::emit_set_z_flag(ctx, ra, block, inst_ref, inst),
        Opcode::GetCFlag => state::emit_get_c_flag(ctx, ra, block, inst_ref, inst),
        Opcode::SetCFlag => state::emit_set_c_flag(ctx, ra, block, inst_ref, inst),
        Opcode::GetVFlag => state::emit_get_v_flag(ctx, ra, block, inst_ref, inst),
        Opcode::SetVFlag => state::emit_set_v_flag(ctx, ra, block, inst_ref, inst),
        Opcode::OrQFlag => state::emit_or_q_flag(ctx, ra, block, inst_ref, inst),
        Opcode::GetGEFlags => state::emit_get_ge_flags(ctx, ra, block, inst_ref, inst),
        Opcode::SetGEFlags => state::emit_set_ge_flags(ctx, ra, block, inst_ref, inst),
        Opcode::BXWritePC => state::emit_bx_write_pc(ctx, ra, block, inst_ref, inst),
        Opcode::CallSupervisor => state::emit_call_supervisor(ctx, ra, block, inst_ref, inst),
        Opcode::GetFpscr => state::emit_get_fpscr(ctx, ra, block, inst_ref, inst),
        Opcode::SetFpscr => state::emit_set_fpscr(ctx, ra, block, inst_ref, inst),
        Opcode::GetFpscrNZCV => state::emit_get_fpscr_nzcv(ctx, ra, block, inst_ref, inst),
        Opcode::SetFpscrNZCV => state::emit_set_fpscr_nzcv(ctx, ra, block, inst_ref, inst),

        Opcode::PushRSB => term::emit_push_rsb(ctx, ra, block, inst_ref, inst),

        // Pseudo-ops are consumed by their parent's lowering and erased;
        // reaching one here means the decoder attached it to nothing.
        Opcode::GetCarryFromOp | Opcode::GetOverflowFromOp | Opcode::GetGEFromOp => {
            panic!("Pseudo-op {} reached the emitter without a parent", inst.opcode)
        }

        // Data movement and casts
        Opcode::Pack2x32To1x64 => dp::emit_pack_2x32_to_1x64(ctx, ra, block, inst_ref, inst),
        Opcode::LeastSignificantWord => dp::emit_least_significant_word(ctx, ra, block, inst_ref, inst),
        Opcode::MostSignificantWord => dp::emit_most_significant_word(ctx, ra, block, inst_ref, inst),
        Opcode::LeastSignificantHalf => dp::emit_least_significant_half(ctx, ra, block, inst_ref, inst),
        Opcode::LeastSignificantByte => dp::emit_least_significant_byte(ctx, ra, block, inst_ref, inst),
        Opcode::MostSignificantBit => dp::emit_most_significant_bit(ctx, ra, block, inst_ref, inst),
        Opcode::IsZero => dp::emit_is_zero(ctx, ra, block, inst_ref, inst),
        Opcode::IsZero64 => dp::emit_is_zero64(ctx, ra, block, inst_ref, inst),

        // Shifts
        Opcode::LogicalShiftLeft => dp::emit_logical_shift_left(ctx, ra, block, inst_ref, inst),
        Opcode::LogicalShiftRight => dp::emit_logical_shift_right(ctx, ra, block, inst_ref, inst),
        Opcode::LogicalShiftRight64 => dp::emit_logical_shift_right64(ctx, ra, block, inst_ref, inst),
        Opcode::ArithmeticShiftRight => dp::emit_arithmetic_shift_right(ctx, ra, block, inst_ref, inst),
        Opcode::RotateRight => dp::emit_rotate_right(ctx, ra, block, inst_ref, inst),
        Opcode::RotateRightExtended => dp::emit_rotate_right_extended(ctx, ra, block, inst_ref, inst),

        // Arithmetic
        Opcode::AddWithCarry => dp::emit_add_with_carry(ctx, ra, block, inst_ref, inst),
        Opcode::SubWithCarry => dp::emit_sub_with_carry(ctx, ra, block, inst_ref, inst),
        Opcode::Add64 => dp::emit_add64(ctx, ra, block, inst_ref, inst),
        Opcode::Sub64 => dp::emit_sub64(ctx, ra, block, inst_ref, inst),
        Opcode::Mul => dp::emit_mul(ctx, ra, block, inst_ref, inst),
        Opcode::Mul64 => dp::emit_mul64(ctx, ra, block, inst_ref, inst),

        // Bitwise
        Opcode::And => dp::emit_and(ctx, ra, block, inst_ref, inst),
        Opcode::Eor => dp::emit_eor(ctx, ra, block, inst_ref, inst),
        Opcode::Or => dp::emit_or(ctx, ra, block, inst_ref, inst),
        Opcode::Not => dp::emit_not(ctx, ra, block, inst_ref, inst),

        // Extensions
        Opcode::SignExtendWordToLong => dp::emit_sign_extend_word_to_long(ctx, ra, block, inst_ref, inst),
        Opcode::SignExtendHalfToWord => dp::emit_sign_extend_half_to_word(ctx, ra, block, inst_ref, inst),
        Opcode::SignExtendByteToWord => dp::emit_sign_extend_byte_to_word(ctx, ra, block, inst_ref, inst),
        Opcode::ZeroExtendWordToLong => dp::emit_zero_extend_word_to_long(ctx, ra, block, inst_ref, inst),
        Opcode::ZeroExtendHalfToWord => dp::emit_zero_extend_half_to_word(ctx, ra, block, inst_ref, inst),
        Opcode::ZeroExtendByteToWord => dp::emit_zero_extend_byte_to_word(ctx, ra, block, inst_ref, inst),

        // Bit utilities
        Opcode::ByteReverseWord => dp::emit_byte_reverse_word(ctx, ra, block, inst_ref, inst),
        Opcode::ByteReverseHalf => dp::emit_byte_reverse_half(ctx, ra, block, inst_ref, inst),
        Opcode::ByteReverseDual => dp::emit_byte_reverse_dual(ctx, ra, block, inst_ref, inst),
        Opcode::CountLeadingZeros => dp::emit_count_leading_zeros(ctx, ra, block, inst_ref, inst),

        // Saturation
        Opcode::SignedSaturatedAdd => sat::emit_signed_saturated_add(ctx, ra, block, inst_ref, inst),
        Opcode::SignedSaturatedSub => sat::emit_signed_saturated_sub(ctx, ra, block, inst_ref, inst),
        Opcode::UnsignedSaturation => sat::emit_unsigned_saturation(ctx, ra, block, inst_ref, inst),
        Opcode::SignedSaturation => sat::emit_signed_saturation(ctx, ra, block, inst_ref, inst),

        // Packed
        Opcode::PackedAddU8 => packed::emit_packed_add_u8(ctx, ra, block, inst_ref, inst),
        Opcode::PackedAddS8 => packed::emit_packed_add_s8(ctx, ra, block, inst_ref, inst),
        Opcode::PackedAddU16 => packed::emit_packed_add_u16(ctx, ra, block, inst_ref, inst),
        Opcode::PackedAddS16 => packed::emit_packed_add_s16(ctx, ra, block, inst_ref, inst),
        Opcode::PackedSubU8 => packed::emit_packed_sub_u8(ctx, ra, block, inst_ref, inst),
        Opcode::PackedSubS8 => packed::emit_packed_sub_s8(ctx, ra, block, inst_ref, inst),
        Opcode::PackedSubU16 => packed::emit_packed_sub_u16(ctx, ra, block, inst_ref, inst),
        Opcode::PackedSubS16 => packed::emit_packed_sub_s16(ctx, ra, block, inst_ref, inst),
        Opcode::PackedHalvingAddU8 => packed::emit_packed_halving_add_u8(ctx, ra, block, inst_ref, inst),
        Opcode::PackedHalvingAddS8 => packed::emit_packed_halving_add_s8(ctx, ra, block, inst_ref, inst),
        Opcode::PackedHalvingAddU16 => packed::emit_packed_halving_add_u16(ctx, ra, block, inst_ref, inst),
        Opcode::PackedHalvingAddS16 => packed::emit_packed_halving_add_s16(ctx, ra, block, inst_ref, inst),
        Opcode::PackedHalvingSubU8 => packed::emit_packed_halving_sub_u8(ctx, ra, block, inst_ref, inst),
        Opcode::PackedHalvingSubS8 => packed::emit_packed_halving_sub_s8(ctx, ra, block, inst_ref, inst),
        Opcode::PackedHalvingSubU16 => packed::emit_packed_halving_sub_u16(ctx, ra, block, inst_ref, inst),
        Opcode::PackedHalvingSubS16 => packed::emit_packed_halving_sub_s16(ctx, ra, block, inst_ref, inst),
        Opcode::PackedHalvingSubAddU16 => packed::emit_packed_halving_sub_add_u16(ctx, ra, block, inst_ref, inst),
        Opcode::PackedHalvingSubAddS16 => packed::emit_packed_halving_sub_add_s16(ctx, ra, block, inst_ref, inst),
        Opcode::PackedSaturatedAddU8 => packed::emit_packed_saturated_add_u8(ctx, ra, block, inst_ref, inst),
        Opcode::PackedSaturatedAddS8 => packed::emit_packed_saturated_add_s8(ctx, ra, block, inst_ref, inst),
        Opcode::PackedSaturatedAddU16 => packed::emit_packed_saturated_add_u16(ctx, ra, block, inst_ref, inst),
        Opcode::PackedSaturatedAddS16 => packed::emit_packed_saturated_add_s16(ctx, ra, block, inst_ref, inst),
        Opcode::PackedSaturatedSubU8 => packed::emit_packed_saturated_sub_u8(ctx, ra, block, inst_ref, inst),
        Opcode::PackedSaturatedSubS8 => packed::emit_packed_saturated_sub_s8(ctx, ra, block, inst_ref, inst),
        Opcode::PackedSaturatedSubU16 => packed::emit_packed_saturated_sub_u16(ctx, ra, block, inst_ref, inst),
        Opcode::PackedSaturatedSubS16 => packed::emit_packed_saturated_sub_s16(ctx, ra, block, inst_ref, inst),
        Opcode::PackedAbsDiffSumS8 => packed::emit_packed_abs_diff_sum_s8(ctx, ra, block, inst_ref, inst),

        // GPR <-> FP transfers
        Opcode::TransferToFP32 => fp::emit_transfer_to_fp32(ctx, ra, block, inst_ref, inst),
        Opcode::TransferFromFP32 => fp::emit_transfer_from_fp32(ctx, ra, block, inst_ref, inst),
        Opcode::TransferToFP64 => fp::emit_transfer_to_fp64(ctx, ra, block, inst_ref, inst),
        Opcode::TransferFromFP64 => fp::emit_transfer_from_fp64(ctx, ra, block, inst_ref, inst),

        // Floating point
        Opcode::FPAbs32 => fp::emit_fp_abs32(ctx, ra, block, inst_ref, inst),
        Opcode::FPAbs64 => fp::emit_fp_abs64(ctx, ra, block, inst_ref, inst),
        Opcode::FPNeg32 => fp::emit_fp_neg32(ctx, ra, block, inst_ref, inst),
        Opcode::FPNeg64 => fp::emit_fp_neg64(ctx, ra, block, inst_ref, inst),
        Opcode::FPAdd32 => fp::emit_fp_add32(ctx, ra, block, inst_ref, inst),
        Opcode::FPAdd64 => fp::emit_fp_add64(ctx, ra, block, inst_ref, inst),
        Opcode::FPSub32 => fp::emit_fp_sub32(ctx, ra, block, inst_ref, inst),
        Opcode::FPSub64 => fp::emit_fp_sub64(ctx, ra, block, inst_ref, inst),
        Opcode::FPMul32 => fp::emit_fp_mul32(ctx, ra, block, inst_ref, inst),
        Opcode::FPMul64 => fp::emit_fp_mul64(ctx, ra, block, inst_ref, inst),
        Opcode::FPDiv32 => fp::emit_fp_div32(ctx, ra, block, inst_ref, inst),
        Opcode::FPDiv64 => fp::emit_fp_div64(ctx, ra, block, inst_ref, inst),
        Opcode::FPSqrt32 => fp::emit_fp_sqrt32(ctx, ra, block, inst_ref, inst),
        Opcode::FPSqrt64 => fp::emit_fp_sqrt64(ctx, ra, block, inst_ref, inst),
        Opcode::FPCompare32 => fp::emit_fp_compare32(ctx, ra, block, inst_ref, inst),
        Opcode::FPCompare64 => fp::emit_fp_compare64(ctx, ra, block, inst_ref, inst),
        Opcode::FPSingleToDouble => fp::emit_fp_single_to_double(ctx, ra, block, inst_ref, inst),
        Opcode::FPDoubleToSingle => fp::emit_fp_double_to_single(ctx, ra, block, inst_ref, inst),
        Opcode::FPSingleToS32 => fp::emit_fp_single_to_s32(ctx, ra, block, inst_ref, inst),
        Opcode::FPSingleToU32 => fp::emit_fp_single_to_u32(ctx, ra, block, inst_ref, inst),
        Opcode::FPDoubleToS32 => fp::emit_fp_double_to_s32(ctx, ra, block, inst_ref, inst),
        Opcode::FPDoubleToU32 => fp::emit_fp_double_to_u32(ctx, ra, block, inst_ref, inst),
        Opcode::FPS32ToSingle => fp::emit_fp_s32_to_single(ctx, ra, block, inst_ref, inst),
        Opcode::FPU32ToSingle => fp::emit_fp_u32_to_single(ctx, ra, block, inst_ref, inst),
        Opcode::FPS32ToDouble => fp::emit_fp_s32_to_double(ctx, ra, block, inst_ref, inst),
        Opcode::FPU32ToDouble => fp::emit_fp_u32_to_double(ctx, ra, block, inst_ref, inst),

        // Memory
        Opcode::ClearExclusive => mem::emit_clear_exclusive(ctx, ra, block, inst_ref, inst),
        Opcode::SetExclusive => mem::emit_set_exclusive(ctx, ra, block, inst_ref, inst),
        Opcode::ReadMemory8 => mem::emit_read_memory_8(ctx, ra, block, inst_ref, inst),
        Opcode::ReadMemory16 => mem::emit_read_memory_16(ctx, ra, block, inst_ref, inst),
        Opcode::ReadMemory32 => mem::emit_read_memory_32(ctx, ra, block, inst_ref, inst),
        Opcode::ReadMemory64 => mem::emit_read_memory_64(ctx, ra, block, inst_ref, inst),
        Opcode::WriteMemory8 => mem::emit_write_memory_8(ctx, ra, block, inst_ref, inst),
        Opcode::WriteMemory16 => mem::emit_write_memory_16(ctx, ra, block, inst_ref, inst),
        Opcode::WriteMemory32 => mem::emit_write_memory_32(ctx, ra, block, inst_ref, inst),
        Opcode::WriteMemory64 => mem::emit_write_memory_64(ctx, ra, block, inst_ref, inst),
        Opcode::ExclusiveWriteMemory8 => mem::emit_exclusive_write_memory_8(ctx, ra, block, inst_ref, inst),
        Opcode::ExclusiveWriteMemory16 => mem::emit_exclusive_write_memory_16(ctx, ra, block, inst_ref, inst),
        Opcode::ExclusiveWriteMemory32 => mem::emit_exclusive_write_memory_32(ctx, ra, block, inst_ref, inst),
        Opcode::ExclusiveWriteMemory64 => mem::emit_exclusive_write_memory_64(ctx, ra, block, inst_ref, inst),

        // Coprocessor
        Opcode::CoprocInternalOperation => coproc::emit_coproc_internal_operation(ctx, ra, block, inst_ref, inst),
        Opcode::CoprocSendOneWord => coproc::emit_coproc_send_one_word(ctx, ra, block, inst_ref, inst),
        Opcode::CoprocSendTwoWords => coproc::emit_coproc_send_two_words(ctx, ra, block, inst_ref, inst),
        Opcode::CoprocGetOneWord => coproc::emit_coproc_get_one_word(ctx, ra, block, inst_ref, inst),
        Opcode::CoprocGetTwoWords => coproc::emit_coproc_get_two_words(ctx, ra, block, inst_ref, inst),
        Opcode::CoprocLoadWords => coproc::emit_coproc_load_words(ctx, ra, block, inst_ref, inst),
        Opcode::CoprocStoreWords => coproc::emit_coproc_store_words(ctx, ra, block, inst_ref, inst),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::Reg as ArmReg;
    use crate::backend::x64::callback::ArgCallback;
    use crate::backend::x64::jit_state::JitState;
    use crate::config::{UserCallbacks, PAGE_TABLE_SIZE};
    use crate::ir::cond::Cond;
    use crate::ir::terminal::Terminal;
    use crate::ir::value::Value;
    use std::collections::HashMap;

    /// Guest memory and call counters backing the test callbacks.
    #[derive(Default)]
    struct TestEnv {
        mem: HashMap<u32, u64>,
        reads: usize,
        writes: usize,
        svcs: Vec<u32>,
        interpreter_calls: usize,
    }

    extern "sysv64" fn env_read(env: u64, vaddr: u64) -> u64 {
        let env = unsafe { &mut *(env as *mut TestEnv) };
        env.reads += 1;
        env.mem.get(&(vaddr as u32)).copied().unwrap_or(0xAAAA_AAAA_AAAA_AAAA)
    }

    extern "sysv64" fn env_write(env: u64, vaddr: u64, value: u64) {
        let env = unsafe { &mut *(env as *mut TestEnv) };
        env.writes += 1;
        env.mem.insert(vaddr as u32, value);
    }

    extern "sysv64" fn env_svc(env: u64, imm: u64) {
        let env = unsafe { &mut *(env as *mut TestEnv) };
        env.svcs.push(imm as u32);
    }

    extern "sysv64" fn env_interpreter(env: u64, _pc: u64, _jit: u64, _user_arg: u64) {
        let env = unsafe { &mut *(env as *mut TestEnv) };
        env.interpreter_calls += 1;
    }

    struct Fixture {
        env: *mut TestEnv,
        emit: EmitX64,
        /// Keeps the page table and its pages alive while emitted code runs.
        _page_table: Option<(Box<[*mut u8]>, Vec<Box<[u8; 4096]>>)>,
    }

    impl Fixture {
        /// `mapped_pages`: guest page numbers to back with host memory.
        fn new(mapped_pages: &[u32]) -> Fixture {
            let env = Box::into_raw(Box::new(TestEnv::default()));
            let env_u64 = env as u64;

            let cb = |f: u64| Box::new(ArgCallback::new(f, env_u64)) as Box<dyn crate::backend::x64::callback::Callback>;
            let callbacks = UserCallbacks {
                interpreter_fallback: cb(env_interpreter as usize as u64),
                call_svc: cb(env_svc as usize as u64),
                memory_read_8: cb(env_read as usize as u64),
                memory_read_16: cb(env_read as usize as u64),
                memory_read_32: cb(env_read as usize as u64),
                memory_read_64: cb(env_read as usize as u64),
                memory_write_8: cb(env_write as usize as u64),
                memory_write_16: cb(env_write as usize as u64),
                memory_write_32: cb(env_write as usize as u64),
                memory_write_64: cb(env_write as usize as u64),
            };

            let page_table = if mapped_pages.is_empty() {
                None
            } else {
                let mut table = vec![std::ptr::null_mut::<u8>(); PAGE_TABLE_SIZE].into_boxed_slice();
                let mut pages = Vec::new();
                for &page in mapped_pages {
                    let mut storage: Box<[u8; 4096]> = Box::new([0; 4096]);
                    table[page as usize] = storage.as_mut_ptr();
                    pages.push(storage);
                }
                Some((table, pages))
            };

            let config = crate::config::UserConfig {
                callbacks,
                page_table: page_table.as_ref().map(|(t, _)| t.as_ptr() as *mut *mut u8),
                coprocessors: Default::default(),
                user_arg: env_u64,
                jit_ptr: 0x1234,
                code_cache_size: 4 * 1024 * 1024,
            };

            Fixture {
                env,
                emit: EmitX64::new(config).unwrap(),
                _page_table: page_table,
            }
        }

        fn env(&self) -> &mut TestEnv {
            unsafe { &mut *self.env }
        }

        fn run(&mut self, block: &mut Block, state: &mut JitState) -> BlockDescriptor {
            let descriptor = self.emit.emit(block);
            self.run_at(descriptor, state);
            descriptor
        }

        fn run_at(&mut self, descriptor: BlockDescriptor, state: &mut JitState) {
            let entry = self.emit.block_entrypoint(descriptor);
            unsafe { self.emit.run_code_fn()(state, entry) };
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            unsafe { drop(Box::from_raw(self.env)) };
        }
    }

    fn get_reg(block: &mut Block, reg: ArmReg) -> Value {
        Value::Inst(block.append(Opcode::GetRegister, &[Value::ImmRegRef(reg)]))
    }

    fn set_reg(block: &mut Block, reg: ArmReg, value: Value) {
        block.append(Opcode::SetRegister, &[Value::ImmRegRef(reg), value]);
    }

    #[test]
    fn test_simple_add() {
        let mut fixture = Fixture::new(&[]);
        let mut block = Block::new(LocationDescriptor::at(0x1000));
        let a = get_reg(&mut block, ArmReg::R1);
        let b = get_reg(&mut block, ArmReg::R2);
        let sum = block.append(Opcode::AddWithCarry, &[a, b, Value::ImmU1(false)]);
        set_reg(&mut block, ArmReg::R0, Value::Inst(sum));
        block.set_terminal(Terminal::ReturnToDispatch);
        block.cycle_count = 1;

        let mut state = JitState::new();
        state.reg[1] = 5;
        state.reg[2] = 7;
        state.cycles_remaining = 100;
        fixture.run(&mut block, &mut state);

        assert_eq!(state.reg[0], 12);
        assert_eq!(state.cycles_remaining, 99);
    }

    #[test]
    fn test_add_with_carry_flags() {
        let mut fixture = Fixture::new(&[]);
        let mut block = Block::new(LocationDescriptor::at(0x1000));
        let a = get_reg(&mut block, ArmReg::R1);
        let b = get_reg(&mut block, ArmReg::R2);
        let sum = block.append(Opcode::AddWithCarry, &[a, b, Value::ImmU1(false)]);
        let carry = block.append(Opcode::GetCarryFromOp, &[Value::Inst(sum)]);
        let overflow = block.append(Opcode::GetOverflowFromOp, &[Value::Inst(sum)]);
        set_reg(&mut block, ArmReg::R0, Value::Inst(sum));
        block.append(Opcode::SetCFlag, &[Value::Inst(carry)]);
        block.append(Opcode::SetVFlag, &[Value::Inst(overflow)]);
        block.set_terminal(Terminal::ReturnToDispatch);

        // 0xFFFFFFFF + 1 carries out without signed overflow.
        let mut state = JitState::new();
        state.reg[1] = 0xFFFF_FFFF;
        state.reg[2] = 1;
        fixture.run(&mut block, &mut state);
        assert_eq!(state.reg[0], 0);
        assert_ne!(state.cpsr & (1 << 29), 0, "C must be set");
        assert_eq!(state.cpsr & (1 << 28), 0, "V must be clear");

        // 0x7FFFFFFF + 1 overflows without carrying.
        let mut state = JitState::new();
        state.reg[1] = 0x7FFF_FFFF;
        state.reg[2] = 1;
        fixture.run_at(fixture.emit.get_block(LocationDescriptor::at(0x1000)).unwrap(), &mut state);
        assert_eq!(state.reg[0], 0x8000_0000);
        assert_eq!(state.cpsr & (1 << 29), 0, "C must be clear");
        assert_ne!(state.cpsr & (1 << 28), 0, "V must be set");
    }

    #[test]
    fn test_sub_with_carry_inverted_borrow() {
        let mut fixture = Fixture::new(&[]);
        let mut block = Block::new(LocationDescriptor::at(0x1000));
        let a = get_reg(&mut block, ArmReg::R1);
        let b = get_reg(&mut block, ArmReg::R2);
        let diff = block.append(Opcode::SubWithCarry, &[a, b, Value::ImmU1(true)]);
        let carry = block.append(Opcode::GetCarryFromOp, &[Value::Inst(diff)]);
        set_reg(&mut block, ArmReg::R0, Value::Inst(diff));
        block.append(Opcode::SetCFlag, &[Value::Inst(carry)]);
        block.set_terminal(Terminal::ReturnToDispatch);

        // 5 - 3: no borrow, so the ARM carry is set.
        let mut state = JitState::new();
        state.reg[1] = 5;
        state.reg[2] = 3;
        fixture.run(&mut block, &mut state);
        assert_eq!(state.reg[0], 2);
        assert_ne!(state.cpsr & (1 << 29), 0);

        // 3 - 5 borrows, so the ARM carry is clear.
        let mut state = JitState::new();
        state.reg[1] = 3;
        state.reg[2] = 5;
        fixture.run_at(fixture.emit.get_block(LocationDescriptor::at(0x1000)).unwrap(), &mut state);
        assert_eq!(state.reg[0], 0xFFFF_FFFE);
        assert_eq!(state.cpsr & (1 << 29), 0);
    }

    #[test]
    fn test_lsl_by_32_result_and_carry() {
        let mut fixture = Fixture::new(&[]);
        let mut block = Block::new(LocationDescriptor::at(0x1000));
        let a = get_reg(&mut block, ArmReg::R1);
        let shifted = block.append(
            Opcode::LogicalShiftLeft,
            &[a, Value::ImmU8(32), Value::ImmU1(false)],
        );
        let carry = block.append(Opcode::GetCarryFromOp, &[Value::Inst(shifted)]);
        set_reg(&mut block, ArmReg::R0, Value::Inst(shifted));
        block.append(Opcode::SetCFlag, &[Value::Inst(carry)]);
        block.set_terminal(Terminal::ReturnToDispatch);

        let mut state = JitState::new();
        state.reg[1] = 0xDEAD_BEEF;
        fixture.run(&mut block, &mut state);

        assert_eq!(state.reg[0], 0);
        assert_ne!(state.cpsr & (1 << 29), 0, "Carry must be bit 0 of the input");
    }

    #[test]
    fn test_variable_shifts_do_not_mask_count() {
        // r0 = r1 << r2 with the count in a register; count 32 and 33 give 0.
        let mut fixture = Fixture::new(&[]);
        let mut block = Block::new(LocationDescriptor::at(0x1000));
        let a = get_reg(&mut block, ArmReg::R1);
        let count_word = get_reg(&mut block, ArmReg::R2);
        let count = block.append(Opcode::LeastSignificantByte, &[count_word]);
        let shifted = block.append(
            Opcode::LogicalShiftLeft,
            &[a, Value::Inst(count), Value::ImmU1(false)],
        );
        set_reg(&mut block, ArmReg::R0, Value::Inst(shifted));
        block.set_terminal(Terminal::ReturnToDispatch);

        let descriptor = fixture.emit.emit(&mut block);
        for (count, expected) in [(4u32, 0xEADB_EEF0u32), (31, 0x8000_0000), (32, 0), (33, 0), (255, 0)] {
            let mut state = JitState::new();
            state.reg[1] = 0xDEAD_BEEF;
            state.reg[2] = count;
            if count == 31 {
                state.reg[1] = 1;
            }
            fixture.run_at(descriptor, &mut state);
            assert_eq!(state.reg[0], expected, "count {}", count);
        }
    }

    #[test]
    fn test_ror_by_multiple_of_32_updates_carry_only() {
        let mut fixture = Fixture::new(&[]);
        let mut block = Block::new(LocationDescriptor::at(0x1000));
        let a = get_reg(&mut block, ArmReg::R1);
        let count_word = get_reg(&mut block, ArmReg::R2);
        let count = block.append(Opcode::LeastSignificantByte, &[count_word]);
        let rotated = block.append(
            Opcode::RotateRight,
            &[a, Value::Inst(count), Value::ImmU1(false)],
        );
        let carry = block.append(Opcode::GetCarryFromOp, &[Value::Inst(rotated)]);
        set_reg(&mut block, ArmReg::R0, Value::Inst(rotated));
        block.append(Opcode::SetCFlag, &[Value::Inst(carry)]);
        block.set_terminal(Terminal::ReturnToDispatch);

        let descriptor = fixture.emit.emit(&mut block);

        // Count 32: value unchanged, carry = bit 31.
        let mut state = JitState::new();
        state.reg[1] = 0x8000_0001;
        state.reg[2] = 32;
        fixture.run_at(descriptor, &mut state);
        assert_eq!(state.reg[0], 0x8000_0001);
        assert_ne!(state.cpsr & (1 << 29), 0);

        // Count 0: value unchanged, carry preserved (clear here).
        let mut state = JitState::new();
        state.reg[1] = 0x8000_0001;
        state.reg[2] = 0;
        fixture.run_at(descriptor, &mut state);
        assert_eq!(state.reg[0], 0x8000_0001);
        assert_eq!(state.cpsr & (1 << 29), 0);

        // Count 1: rotate and set carry from bit 0.
        let mut state = JitState::new();
        state.reg[1] = 0x8000_0001;
        state.reg[2] = 1;
        fixture.run_at(descriptor, &mut state);
        assert_eq!(state.reg[0], 0xC000_0000);
        assert_ne!(state.cpsr & (1 << 29), 0);
    }

    #[test]
    fn test_signed_saturated_add_sets_q() {
        let mut fixture = Fixture::new(&[]);
        let mut block = Block::new(LocationDescriptor::at(0x1000));
        let a = get_reg(&mut block, ArmReg::R1);
        let b = get_reg(&mut block, ArmReg::R2);
        let sum = block.append(Opcode::SignedSaturatedAdd, &[a, b]);
        let overflow = block.append(Opcode::GetOverflowFromOp, &[Value::Inst(sum)]);
        set_reg(&mut block, ArmReg::R0, Value::Inst(sum));
        block.append(Opcode::OrQFlag, &[Value::Inst(overflow)]);
        block.set_terminal(Terminal::ReturnToDispatch);

        let descriptor = fixture.emit.emit(&mut block);

        let mut state = JitState::new();
        state.reg[1] = 0x7FFF_FFFF;
        state.reg[2] = 1;
        fixture.run_at(descriptor, &mut state);
        assert_eq!(state.reg[0], 0x7FFF_FFFF);
        assert_ne!(state.cpsr & (1 << 27), 0, "Q must be set on saturation");

        let mut state = JitState::new();
        state.reg[1] = 5;
        state.reg[2] = 6;
        fixture.run_at(descriptor, &mut state);
        assert_eq!(state.reg[0], 11);
        assert_eq!(state.cpsr & (1 << 27), 0);
    }

    #[test]
    fn test_unsigned_saturation_boundary_sweep() {
        // N = 8: clamp to [0, 255] across every boundary case.
        let mut fixture = Fixture::new(&[]);
        let mut block = Block::new(LocationDescriptor::at(0x1000));
        let a = get_reg(&mut block, ArmReg::R1);
        let sat = block.append(Opcode::UnsignedSaturation, &[a, Value::ImmU8(8)]);
        let overflow = block.append(Opcode::GetOverflowFromOp, &[Value::Inst(sat)]);
        set_reg(&mut block, ArmReg::R0, Value::Inst(sat));
        block.append(Opcode::OrQFlag, &[Value::Inst(overflow)]);
        block.set_terminal(Terminal::ReturnToDispatch);

        let descriptor = fixture.emit.emit(&mut block);
        let cases = [
            (0xFFFF_FFFFu32, 0u32, true), // -1
            (0, 0, false),
            (255, 255, false),
            (256, 255, true),
            (0x8000_0000, 0, true),
        ];
        for (input, expected, saturates) in cases {
            let mut state = JitState::new();
            state.reg[1] = input;
            fixture.run_at(descriptor, &mut state);
            assert_eq!(state.reg[0], expected, "input {:#x}", input);
            assert_eq!(state.cpsr & (1 << 27) != 0, saturates, "input {:#x}", input);
        }
    }

    #[test]
    fn test_packed_add_u8_ge_flags() {
        let mut fixture = Fixture::new(&[]);
        let mut block = Block::new(LocationDescriptor::at(0x1000));
        let a = get_reg(&mut block, ArmReg::R1);
        let b = get_reg(&mut block, ArmReg::R2);
        let sum = block.append(Opcode::PackedAddU8, &[a, b]);
        let ge = block.append(Opcode::GetGEFromOp, &[Value::Inst(sum)]);
        set_reg(&mut block, ArmReg::R0, Value::Inst(sum));
        block.append(Opcode::SetGEFlags, &[Value::Inst(ge)]);
        block.set_terminal(Terminal::ReturnToDispatch);

        let mut state = JitState::new();
        // Lanes (MSB first): 0xFF+0x01 carries, 0x7F+0x10 doesn't,
        // 0x80+0x80 carries, 0x01+0x02 doesn't.
        state.reg[1] = 0xFF_7F_80_01;
        state.reg[2] = 0x01_10_80_02;
        fixture.run(&mut block, &mut state);

        assert_eq!(state.reg[0], 0x00_8F_00_03);
        assert_eq!((state.cpsr >> 16) & 0xF, 0b1010);
    }

    #[test]
    fn test_packed_halving_ops() {
        let mut fixture = Fixture::new(&[]);
        let mut block = Block::new(LocationDescriptor::at(0x1000));
        let a = get_reg(&mut block, ArmReg::R1);
        let b = get_reg(&mut block, ArmReg::R2);
        let uadd8 = block.append(Opcode::PackedHalvingAddU8, &[a, b]);
        set_reg(&mut block, ArmReg::R0, Value::Inst(uadd8));
        let a2 = get_reg(&mut block, ArmReg::R1);
        let b2 = get_reg(&mut block, ArmReg::R2);
        let sadd16 = block.append(Opcode::PackedHalvingAddS16, &[a2, b2]);
        set_reg(&mut block, ArmReg::R3, Value::Inst(sadd16));
        block.set_terminal(Terminal::ReturnToDispatch);

        let mut state = JitState::new();
        state.reg[1] = 0xFFFF_0004;
        state.reg[2] = 0x0001_0002;
        fixture.run(&mut block, &mut state);

        // UHADD8 lanes: (0xFF+0x00)/2, (0xFF+0x01)/2, (0x00+0x00)/2, (4+2)/2.
        assert_eq!(state.reg[0], 0x7F_80_00_03);
        // SHADD16 lanes: (-1 + 1)/2 = 0, (4 + 2)/2 = 3.
        assert_eq!(state.reg[3], 0x0000_0003);
    }

    #[test]
    fn test_bx_write_pc_variable() {
        let mut fixture = Fixture::new(&[]);
        let mut block = Block::new(LocationDescriptor::at(0x1000));
        let target = get_reg(&mut block, ArmReg::R1);
        block.append(Opcode::BXWritePC, &[target]);
        block.set_terminal(Terminal::ReturnToDispatch);

        let descriptor = fixture.emit.emit(&mut block);

        // Thumb target: bit 0 set -> T set, bit 0 cleared from PC.
        let mut state = JitState::new();
        state.reg[1] = 0x0000_2001;
        fixture.run_at(descriptor, &mut state);
        assert_eq!(state.reg[15], 0x2000);
        assert_ne!(state.cpsr & (1 << 5), 0);

        // ARM target: word-aligned PC, T cleared.
        let mut state = JitState::new();
        state.cpsr = 1 << 5;
        state.reg[1] = 0x0000_3002;
        fixture.run_at(descriptor, &mut state);
        assert_eq!(state.reg[15], 0x3000);
        assert_eq!(state.cpsr & (1 << 5), 0);
    }

    #[test]
    fn test_fp_add_via_transfers() {
        let mut fixture = Fixture::new(&[]);
        let mut block = Block::new(LocationDescriptor::at(0x1000));
        let a = get_reg(&mut block, ArmReg::R1);
        let b = get_reg(&mut block, ArmReg::R2);
        let fa = block.append(Opcode::TransferToFP32, &[a]);
        let fb = block.append(Opcode::TransferToFP32, &[b]);
        let sum = block.append(Opcode::FPAdd32, &[Value::Inst(fa), Value::Inst(fb)]);
        let bits = block.append(Opcode::TransferFromFP32, &[Value::Inst(sum)]);
        set_reg(&mut block, ArmReg::R0, Value::Inst(bits));
        block.set_terminal(Terminal::ReturnToDispatch);

        let mut state = JitState::new();
        state.reg[1] = 1.5f32.to_bits();
        state.reg[2] = 2.25f32.to_bits();
        fixture.run(&mut block, &mut state);

        assert_eq!(f32::from_bits(state.reg[0]), 3.75);
    }

    #[test]
    fn test_fp_single_to_s32_saturates() {
        let mut fixture = Fixture::new(&[]);
        let mut block = Block::new(LocationDescriptor::at(0x1000));
        let a = get_reg(&mut block, ArmReg::R1);
        let fa = block.append(Opcode::TransferToFP32, &[a]);
        let converted = block.append(Opcode::FPSingleToS32, &[Value::Inst(fa), Value::ImmU1(true)]);
        let bits = block.append(Opcode::TransferFromFP32, &[Value::Inst(converted)]);
        set_reg(&mut block, ArmReg::R0, Value::Inst(bits));
        block.set_terminal(Terminal::ReturnToDispatch);

        let descriptor = fixture.emit.emit(&mut block);
        let cases = [
            (42.7f32, 42u32),
            (-100.9f32, -100i32 as u32),
            (3e9f32, 0x7FFF_FFFF),
            (-3e9f32, 0x8000_0000),
        ];
        for (input, expected) in cases {
            let mut state = JitState::new();
            state.reg[1] = input.to_bits();
            fixture.run_at(descriptor, &mut state);
            assert_eq!(state.reg[0], expected, "input {}", input);
        }
    }

    #[test]
    fn test_memory_round_trip_with_page_table() {
        let mut fixture = Fixture::new(&[1]); // map guest 0x1000..0x2000
        let mut block = Block::new(LocationDescriptor::at(0x1000));
        let addr = get_reg(&mut block, ArmReg::R1);
        let value = get_reg(&mut block, ArmReg::R2);
        block.append(Opcode::WriteMemory32, &[addr, value]);
        let addr2 = get_reg(&mut block, ArmReg::R1);
        let loaded = block.append(Opcode::ReadMemory32, &[addr2]);
        set_reg(&mut block, ArmReg::R0, Value::Inst(loaded));
        block.set_terminal(Terminal::ReturnToDispatch);

        let mut state = JitState::new();
        state.reg[1] = 0x1004;
        state.reg[2] = 0xDEAD_BEEF;
        fixture.run(&mut block, &mut state);

        assert_eq!(state.reg[0], 0xDEAD_BEEF);
        assert_eq!(fixture.env().reads, 0, "Mapped access must not hit the callbacks");
        assert_eq!(fixture.env().writes, 0);

        // An unmapped page takes the slow path exactly once per access.
        let mut block = Block::new(LocationDescriptor::at(0x2000));
        let addr = get_reg(&mut block, ArmReg::R1);
        let loaded = block.append(Opcode::ReadMemory32, &[addr]);
        set_reg(&mut block, ArmReg::R0, Value::Inst(loaded));
        block.set_terminal(Terminal::ReturnToDispatch);

        let mut state = JitState::new();
        state.reg[1] = 0x0080_0000;
        fixture.env().mem.insert(0x0080_0000, 0x1234_5678);
        fixture.run(&mut block, &mut state);

        assert_eq!(state.reg[0], 0x1234_5678);
        assert_eq!(fixture.env().reads, 1);
    }

    #[test]
    fn test_memory_callbacks_without_page_table() {
        let mut fixture = Fixture::new(&[]);
        let mut block = Block::new(LocationDescriptor::at(0x1000));
        let addr = get_reg(&mut block, ArmReg::R1);
        let value = get_reg(&mut block, ArmReg::R2);
        block.append(Opcode::WriteMemory32, &[addr, value]);
        let addr2 = get_reg(&mut block, ArmReg::R1);
        let loaded = block.append(Opcode::ReadMemory32, &[addr2]);
        set_reg(&mut block, ArmReg::R0, Value::Inst(loaded));
        block.set_terminal(Terminal::ReturnToDispatch);

        let mut state = JitState::new();
        state.reg[1] = 0x4000;
        state.reg[2] = 0xCAFE_F00D;
        fixture.run(&mut block, &mut state);

        assert_eq!(state.reg[0], 0xCAFE_F00D);
        assert_eq!(fixture.env().reads, 1);
        assert_eq!(fixture.env().writes, 1);
    }

    #[test]
    fn test_exclusive_store_without_reservation_fails() {
        let mut fixture = Fixture::new(&[]);
        let mut block = Block::new(LocationDescriptor::at(0x1000));
        block.append(Opcode::ClearExclusive, &[]);
        let addr = get_reg(&mut block, ArmReg::R1);
        let value = get_reg(&mut block, ArmReg::R2);
        let passed = block.append(Opcode::ExclusiveWriteMemory32, &[addr, value]);
        set_reg(&mut block, ArmReg::R0, Value::Inst(passed));
        block.set_terminal(Terminal::ReturnToDispatch);

        let mut state = JitState::new();
        state.exclusive_state = 1;
        state.reg[1] = 0x4000;
        state.reg[2] = 7;
        fixture.run(&mut block, &mut state);

        assert_eq!(state.reg[0], 1, "Store must report failure");
        assert_eq!(fixture.env().writes, 0, "Write callback must not run");
    }

    #[test]
    fn test_exclusive_store_with_matching_reservation() {
        let mut fixture = Fixture::new(&[]);
        let mut block = Block::new(LocationDescriptor::at(0x1000));
        let addr0 = get_reg(&mut block, ArmReg::R1);
        block.append(Opcode::SetExclusive, &[addr0, Value::ImmU8(4)]);
        let addr = get_reg(&mut block, ArmReg::R1);
        let value = get_reg(&mut block, ArmReg::R2);
        let passed = block.append(Opcode::ExclusiveWriteMemory32, &[addr, value]);
        set_reg(&mut block, ArmReg::R0, Value::Inst(passed));
        block.set_terminal(Terminal::ReturnToDispatch);

        let mut state = JitState::new();
        state.reg[1] = 0x4000;
        state.reg[2] = 0xFEED;
        fixture.run(&mut block, &mut state);

        assert_eq!(state.reg[0], 0, "Store must report success");
        assert_eq!(state.exclusive_state, 0, "Reservation must be consumed");
        assert_eq!(fixture.env().writes, 1);
        assert_eq!(fixture.env().mem[&0x4000], 0xFEED);
    }

    #[test]
    fn test_block_linking_and_unpatch_bytes() {
        let mut fixture = Fixture::new(&[]);

        let loc_b = LocationDescriptor::at(0x2000);
        let mut block_b = Block::new(loc_b);
        set_reg(&mut block_b, ArmReg::R0, Value::ImmU32(0x77));
        block_b.set_terminal(Terminal::ReturnToDispatch);
        let desc_b = fixture.emit.emit(&mut block_b);

        let mut block_a = Block::new(LocationDescriptor::at(0x1000));
        set_reg(&mut block_a, ArmReg::R1, Value::ImmU32(0x11));
        block_a.set_terminal(Terminal::LinkBlockFast { next: loc_b });
        let desc_a = fixture.emit.emit(&mut block_a);

        // The 13-byte patch region sits just before the trailing int3.
        let site = desc_a.entrypoint_offset + desc_a.size - 14;
        let bytes = fixture.emit.code.asm.bytes();
        assert_eq!(bytes[site], 0xE9, "Linked site must start with jmp rel32");
        let rel = i32::from_le_bytes(bytes[site + 1..site + 5].try_into().unwrap());
        assert_eq!(
            (site as i64 + 5 + rel as i64) as usize,
            desc_b.entrypoint_offset,
            "jmp must land on block B"
        );
        assert!(bytes[site + 5..site + 13].iter().all(|&b| b == 0x90));

        // Executing A falls straight through into B.
        let mut state = JitState::new();
        fixture.run_at(desc_a, &mut state);
        assert_eq!(state.reg[1], 0x11);
        assert_eq!(state.reg[0], 0x77);

        // Unpatching rewrites the site to set PC and return to dispatch.
        fixture.emit.unpatch(loc_b);
        let bytes = fixture.emit.code.asm.bytes();
        assert_eq!(&bytes[site..site + 4], &[0x41, 0xC7, 0x47, 0x3C]);
        let stored_pc = u32::from_le_bytes(bytes[site + 4..site + 8].try_into().unwrap());
        assert_eq!(stored_pc, 0x2000);
        assert_eq!(bytes[site + 8], 0xE9);

        let mut state = JitState::new();
        fixture.run_at(desc_a, &mut state);
        assert_eq!(state.reg[1], 0x11);
        assert_eq!(state.reg[0], 0, "Unlinked block must not reach B");
        assert_eq!(state.reg[15], 0x2000, "PC must point at the unlinked target");
    }

    #[test]
    fn test_link_block_checks_cycles() {
        let mut fixture = Fixture::new(&[]);

        let loc_b = LocationDescriptor::at(0x2000);
        let mut block_b = Block::new(loc_b);
        set_reg(&mut block_b, ArmReg::R0, Value::ImmU32(0x99));
        block_b.set_terminal(Terminal::ReturnToDispatch);
        fixture.emit.emit(&mut block_b);

        let mut block_a = Block::new(LocationDescriptor::at(0x1000));
        block_a.cycle_count = 1;
        block_a.set_terminal(Terminal::LinkBlock { next: loc_b });
        let desc_a = fixture.emit.emit(&mut block_a);

        // Budget left: the link is taken.
        let mut state = JitState::new();
        state.cycles_remaining = 10;
        fixture.run_at(desc_a, &mut state);
        assert_eq!(state.reg[0], 0x99);

        // Budget exhausted: return to the dispatcher with PC set.
        let mut state = JitState::new();
        state.cycles_remaining = 1;
        fixture.run_at(desc_a, &mut state);
        assert_eq!(state.reg[0], 0);
        assert_eq!(state.reg[15], 0x2000);
    }

    #[test]
    fn test_link_idempotence() {
        // Emitting A then B produces the same final bytes for A's patch
        // site as emitting B then A.
        let loc_a = LocationDescriptor::at(0x1000);
        let loc_b = LocationDescriptor::at(0x2000);

        let make_a = || {
            let mut block = Block::new(loc_a);
            block.set_terminal(Terminal::LinkBlockFast { next: loc_b });
            block
        };
        let make_b = || {
            let mut block = Block::new(loc_b);
            block.set_terminal(Terminal::ReturnToDispatch);
            block
        };

        let mut fwd = Fixture::new(&[]);
        let fwd_b = fwd.emit.emit(&mut make_b());
        let fwd_a = fwd.emit.emit(&mut make_a());

        let mut rev = Fixture::new(&[]);
        let rev_a = rev.emit.emit(&mut make_a());
        let rev_b = rev.emit.emit(&mut make_b());

        // Force identical layout in both orders before comparing bytes.
        assert_eq!(fwd_b.entrypoint_offset, rev_a.entrypoint_offset);
        assert_eq!(fwd_a.size, rev_a.size);

        let fwd_site = fwd_a.entrypoint_offset + fwd_a.size - 14;
        let rev_site = rev_a.entrypoint_offset + rev_a.size - 14;
        let fwd_rel = {
            let bytes = fwd.emit.code.asm.bytes();
            assert_eq!(bytes[fwd_site], 0xE9);
            i64::from(i32::from_le_bytes(bytes[fwd_site + 1..fwd_site + 5].try_into().unwrap()))
                + fwd_site as i64
                + 5
        };
        let rev_rel = {
            let bytes = rev.emit.code.asm.bytes();
            assert_eq!(bytes[rev_site], 0xE9);
            i64::from(i32::from_le_bytes(bytes[rev_site + 1..rev_site + 5].try_into().unwrap()))
                + rev_site as i64
                + 5
        };
        assert_eq!(fwd_rel as usize, fwd_b.entrypoint_offset);
        assert_eq!(rev_rel as usize, rev_b.entrypoint_offset);
    }

    #[test]
    fn test_rsb_push_and_pop() {
        let mut fixture = Fixture::new(&[]);

        let loc_t = LocationDescriptor::at(0x2000);
        let mut block_t = Block::new(loc_t);
        set_reg(&mut block_t, ArmReg::R0, Value::ImmU32(0x77));
        block_t.set_terminal(Terminal::ReturnToDispatch);
        fixture.emit.emit(&mut block_t);

        let mut block_r = Block::new(LocationDescriptor::at(0x1000));
        block_r.append(Opcode::PushRSB, &[Value::ImmU64(loc_t.unique_hash())]);
        set_reg(&mut block_r, ArmReg::R1, Value::ImmU32(1));
        block_r.set_terminal(Terminal::PopRSBHint);
        let desc_r = fixture.emit.emit(&mut block_r);

        // Guest PC matches the pushed descriptor: the hint jumps into T.
        let mut state = JitState::new();
        state.reg[15] = 0x2000;
        fixture.run_at(desc_r, &mut state);
        assert_eq!(state.reg[1], 1);
        assert_eq!(state.reg[0], 0x77, "RSB hit must reach the target block");
        assert!(state.rsb_location_descriptors.contains(&loc_t.unique_hash()));

        // Mismatched PC: the hint misses and control returns cleanly.
        let mut state = JitState::new();
        state.reg[15] = 0x3000;
        fixture.run_at(desc_r, &mut state);
        assert_eq!(state.reg[1], 1);
        assert_eq!(state.reg[0], 0, "RSB miss must fall back to the dispatcher");
    }

    #[test]
    fn test_cond_prelude_failure_path() {
        let mut fixture = Fixture::new(&[]);

        let mut block = Block::new(LocationDescriptor::at(0x1000));
        block.cond = Cond::NE;
        block.cond_failed_location = Some(LocationDescriptor::at(0x1004));
        block.cond_failed_cycle_count = 1;
        block.cycle_count = 2;
        set_reg(&mut block, ArmReg::R0, Value::ImmU32(42));
        block.set_terminal(Terminal::ReturnToDispatch);
        let descriptor = fixture.emit.emit(&mut block);

        // Z set: NE fails; only the failure cycles are charged.
        let mut state = JitState::new();
        state.cpsr = 1 << 30;
        state.cycles_remaining = 10;
        fixture.run_at(descriptor, &mut state);
        assert_eq!(state.reg[0], 0);
        assert_eq!(state.reg[15], 0x1004);
        assert_eq!(state.cycles_remaining, 9);

        // Z clear: the body runs and the full cycle count is charged.
        let mut state = JitState::new();
        state.cycles_remaining = 10;
        fixture.run_at(descriptor, &mut state);
        assert_eq!(state.reg[0], 42);
        assert_eq!(state.cycles_remaining, 8);
    }

    #[test]
    fn test_check_halt_terminal() {
        let mut fixture = Fixture::new(&[]);

        let mut block = Block::new(LocationDescriptor::at(0x1000));
        set_reg(&mut block, ArmReg::R0, Value::ImmU32(1));
        block.set_terminal(Terminal::check_halt(Terminal::ReturnToDispatch));
        let descriptor = fixture.emit.emit(&mut block);

        let mut state = JitState::new();
        state.halt_requested = 1;
        fixture.run_at(descriptor, &mut state);
        assert_eq!(state.reg[0], 1, "Body still runs; only the terminal polls halt");
    }

    #[test]
    fn test_if_terminal_selects_branch() {
        let mut fixture = Fixture::new(&[]);

        let loc_t = LocationDescriptor::at(0x2000);
        let mut block_t = Block::new(loc_t);
        set_reg(&mut block_t, ArmReg::R0, Value::ImmU32(0xAA));
        block_t.set_terminal(Terminal::ReturnToDispatch);
        fixture.emit.emit(&mut block_t);

        let loc_e = LocationDescriptor::at(0x3000);
        let mut block_e = Block::new(loc_e);
        set_reg(&mut block_e, ArmReg::R0, Value::ImmU32(0xBB));
        block_e.set_terminal(Terminal::ReturnToDispatch);
        fixture.emit.emit(&mut block_e);

        let mut block = Block::new(LocationDescriptor::at(0x1000));
        block.set_terminal(Terminal::if_then_else(
            Cond::EQ,
            Terminal::LinkBlockFast { next: loc_t },
            Terminal::LinkBlockFast { next: loc_e },
        ));
        let descriptor = fixture.emit.emit(&mut block);

        let mut state = JitState::new();
        state.cpsr = 1 << 30; // Z
        fixture.run_at(descriptor, &mut state);
        assert_eq!(state.reg[0], 0xAA);

        let mut state = JitState::new();
        fixture.run_at(descriptor, &mut state);
        assert_eq!(state.reg[0], 0xBB);
    }

    #[test]
    fn test_interpret_terminal_calls_fallback() {
        let mut fixture = Fixture::new(&[]);

        let mut block = Block::new(LocationDescriptor::at(0x1000));
        block.set_terminal(Terminal::Interpret {
            next: LocationDescriptor::at(0x1000),
        });
        let descriptor = fixture.emit.emit(&mut block);

        let mut state = JitState::new();
        fixture.run_at(descriptor, &mut state);
        assert_eq!(state.reg[15], 0x1000);
        assert_eq!(fixture.env().interpreter_calls, 1);
    }

    #[test]
    fn test_call_supervisor() {
        let mut fixture = Fixture::new(&[]);

        let mut block = Block::new(LocationDescriptor::at(0x1000));
        block.append(Opcode::CallSupervisor, &[Value::ImmU32(0x123456)]);
        block.set_terminal(Terminal::ReturnToDispatch);
        let descriptor = fixture.emit.emit(&mut block);

        let mut state = JitState::new();
        fixture.run_at(descriptor, &mut state);
        assert_eq!(fixture.env().svcs, vec![0x123456]);
    }

    #[test]
    fn test_spilling_block_executes_correctly() {
        // More live values than registers: forces spills and reloads while
        // the final sums remain correct.
        let mut fixture = Fixture::new(&[]);
        let mut block = Block::new(LocationDescriptor::at(0x1000));

        // Materialise more simultaneously-live values than there are
        // allocatable GPRs, then fold them together.
        let values: Vec<Value> = (0..18)
            .map(|i| {
                let base = get_reg(&mut block, ArmReg::R1);
                Value::Inst(block.append(Opcode::AddWithCarry, &[
                    base,
                    Value::ImmU32(i),
                    Value::ImmU1(false),
                ]))
            })
            .collect();
        let mut total = values[0];
        for &value in &values[1..] {
            total = Value::Inst(block.append(Opcode::AddWithCarry, &[total, value, Value::ImmU1(false)]));
        }
        set_reg(&mut block, ArmReg::R0, total);
        block.set_terminal(Terminal::ReturnToDispatch);

        let mut state = JitState::new();
        state.reg[1] = 100;
        fixture.run(&mut block, &mut state);

        // sum of (100 + i) for i in 0..18
        assert_eq!(state.reg[0], 18 * 100 + (0..18).sum::<u32>());
    }

    #[test]
    fn test_invalidate_range_unlinks() {
        let mut fixture = Fixture::new(&[]);

        let loc_b = LocationDescriptor::at(0x2000);
        let mut block_b = Block::new(loc_b);
        set_reg(&mut block_b, ArmReg::R0, Value::ImmU32(0x55));
        block_b.set_terminal(Terminal::ReturnToDispatch);
        fixture.emit.emit(&mut block_b);

        let mut block_a = Block::new(LocationDescriptor::at(0x1000));
        block_a.set_terminal(Terminal::LinkBlockFast { next: loc_b });
        let desc_a = fixture.emit.emit(&mut block_a);

        fixture.emit.invalidate_range(0x2000, 4);
        assert!(fixture.emit.get_block(loc_b).is_none());

        let mut state = JitState::new();
        fixture.run_at(desc_a, &mut state);
        assert_eq!(state.reg[0], 0, "Invalidated target must not execute");
        assert_eq!(state.reg[15], 0x2000);
    }
}
