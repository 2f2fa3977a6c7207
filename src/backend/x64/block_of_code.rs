//! Code arena plus the fixed entry/exit machinery emitted into it once:
//! the run_code entry point, the return-from-run-code trampolines, the
//! per-width memory fallback thunks and the floating-point constant area.

use crate::backend::x64::assembler::{
    dword_ptr, Address, CodeAssembler, Reg, RegExp, Result, RAX, RDI, RSI, RSP, R15,
};
use crate::backend::x64::hostloc::{HOST_R10, HOST_R11, HOST_R8, HOST_R9, HOST_RAX, HOST_RCX, HOST_RDX, HOST_RSI, HostLoc};
use crate::backend::x64::jit_state::JitState;
use crate::config::UserCallbacks;

/// Default code cache size (128 MB).
pub const DEFAULT_CODE_SIZE: usize = 128 * 1024 * 1024;

/// Entry point into emitted code.
///
/// Arguments: (jit_state, code_ptr). Returns when a trampoline is reached.
pub type RunCodeFn = unsafe extern "sysv64" fn(*mut JitState, *const u8);

/// Host CPU features the lowerings may take fast paths on.
#[derive(Debug, Clone, Copy)]
pub struct CpuFeatures {
    pub lzcnt: bool,
    pub bmi2: bool,
    pub ssse3: bool,
    pub sse41: bool,
}

impl CpuFeatures {
    #[cfg(target_arch = "x86_64")]
    pub fn detect() -> Self {
        Self {
            lzcnt: std::arch::is_x86_feature_detected!("lzcnt"),
            bmi2: std::arch::is_x86_feature_detected!("bmi2"),
            ssse3: std::arch::is_x86_feature_detected!("ssse3"),
            sse41: std::arch::is_x86_feature_detected!("sse4.1"),
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub fn detect() -> Self {
        Self { lzcnt: false, bmi2: false, ssse3: false, sse41: false }
    }
}

/// Buffer offsets of the 128-bit constants the FP lowerings reference
/// RIP-relatively.
#[derive(Debug, Clone, Copy)]
pub struct FloatConstants {
    pub negative_zero32: usize,
    pub non_sign_mask32: usize,
    pub negative_zero64: usize,
    pub non_sign_mask64: usize,
    pub nan32: usize,
    pub nan64: usize,
    pub penultimate_denormal64: usize,
    pub min_s32: usize,
    pub max_s32: usize,
    pub min_u32: usize,
}

/// Offsets of the prelude entry points within the code buffer.
#[derive(Debug, Clone, Copy)]
pub struct Trampolines {
    pub run_code: usize,
    /// The single resumption surface: restores host MXCSR and returns.
    pub return_from_run_code: usize,
    /// Variant for paths that have already switched MXCSR back.
    pub return_from_run_code_no_mxcsr: usize,
    /// Memory fallback thunks indexed by log2(bit_size) - 3.
    pub read_memory: [usize; 4],
    pub write_memory: [usize; 4],
}

/// The executable arena together with its generated prelude.
///
/// During guest execution R15 holds the `JitState` pointer and RSP is
/// 16-byte aligned, so emitted code may `call` host functions directly.
pub struct BlockOfCode {
    pub asm: CodeAssembler,
    pub trampolines: Trampolines,
    pub consts: FloatConstants,
    pub cpu: CpuFeatures,
    /// Where user blocks begin; `clear_cache` rewinds to here.
    code_begin_offset: usize,
}

fn guest_mxcsr() -> Address {
    dword_ptr(RegExp::from(R15) + JitState::offset_of_guest_mxcsr() as i32)
}

fn host_mxcsr() -> Address {
    dword_ptr(RegExp::from(R15) + JitState::offset_of_save_host_mxcsr() as i32)
}

impl BlockOfCode {
    pub fn new(total_size: usize, callbacks: &UserCallbacks) -> Result<Self> {
        let mut asm = CodeAssembler::new(total_size)?;
        let cpu = CpuFeatures::detect();

        let (trampolines, consts) = Self::gen_prelude(&mut asm, callbacks);
        let code_begin_offset = asm.size();

        Ok(Self {
            asm,
            trampolines,
            consts,
            cpu,
            code_begin_offset,
        })
    }

    /// Discard all emitted blocks, keeping the prelude.
    pub fn clear_cache(&mut self) {
        self.asm.set_size(self.code_begin_offset);
    }

    pub fn space_remaining(&self) -> usize {
        self.asm.capacity() - self.asm.size()
    }

    pub fn code_base_ptr(&self) -> *const u8 {
        self.asm.top()
    }

    pub fn run_code_fn(&self) -> RunCodeFn {
        let ptr = unsafe { self.code_base_ptr().add(self.trampolines.run_code) };
        unsafe { std::mem::transmute::<*const u8, RunCodeFn>(ptr) }
    }

    /// Absolute address of the dispatcher-return trampoline.
    pub fn return_from_run_code_address(&self) -> u64 {
        self.code_base_ptr() as u64 + self.trampolines.return_from_run_code as u64
    }

    // -- Helpers shared with the emitters -----------------------------------

    /// Save the host MXCSR and enter the guest configuration.
    pub fn emit_switch_mxcsr_on_entry(asm: &mut CodeAssembler) {
        asm.stmxcsr(host_mxcsr());
        asm.ldmxcsr(guest_mxcsr());
    }

    /// Save the guest MXCSR and restore the host configuration. Must bracket
    /// every transfer into host code.
    pub fn emit_switch_mxcsr_on_exit(asm: &mut CodeAssembler) {
        asm.stmxcsr(guest_mxcsr());
        asm.ldmxcsr(host_mxcsr());
    }

    /// Call an absolute host address.
    pub fn emit_call_function(asm: &mut CodeAssembler, address: u64) {
        asm.mov_abs64(RAX, address);
        asm.call_reg(RAX);
    }

    // -- Prelude generation --------------------------------------------------

    fn gen_prelude(asm: &mut CodeAssembler, callbacks: &UserCallbacks) -> (Trampolines, FloatConstants) {
        use crate::backend::x64::abi::CALLEE_SAVE_GPRS;

        // ---- run_code(jit_state, code_ptr) ----
        let run_code = asm.size();
        for &loc in CALLEE_SAVE_GPRS {
            asm.push(loc.to_reg64());
        }
        // 6 pushes plus the return address leave RSP 8 (mod 16); one more
        // qword keeps direct calls from emitted code ABI-aligned.
        asm.sub(RSP, 8i32);
        asm.mov(R15, RDI);
        Self::emit_switch_mxcsr_on_entry(asm);
        asm.jmp_reg(RSI);

        // ---- return_from_run_code ----
        let return_from_run_code = asm.size();
        Self::emit_switch_mxcsr_on_exit(asm);
        let return_no_mxcsr = asm.size();
        asm.add(RSP, 8i32);
        for &loc in CALLEE_SAVE_GPRS.iter().rev() {
            asm.pop(loc.to_reg64());
        }
        asm.ret();

        // ---- memory fallback thunks ----
        let mut read_memory = [0usize; 4];
        let mut write_memory = [0usize; 4];
        for (i, bit_size) in [8usize, 16, 32, 64].into_iter().enumerate() {
            read_memory[i] = Self::gen_memory_thunk(asm, callbacks.memory_read(bit_size), false);
            write_memory[i] = Self::gen_memory_thunk(asm, callbacks.memory_write(bit_size), true);
        }

        // ---- floating-point constant area ----
        asm.align(16);
        let mut emit_const = |asm: &mut CodeAssembler, lo: u64, hi: u64| {
            let offset = asm.size();
            asm.dq(lo);
            asm.dq(hi);
            offset
        };
        let consts = FloatConstants {
            negative_zero32: emit_const(asm, 0x8000_0000, 0),
            non_sign_mask32: emit_const(asm, 0x7FFF_FFFF, 0),
            negative_zero64: emit_const(asm, 0x8000_0000_0000_0000, 0),
            non_sign_mask64: emit_const(asm, 0x7FFF_FFFF_FFFF_FFFF, 0),
            nan32: emit_const(asm, 0x7FC0_0000, 0),
            nan64: emit_const(asm, 0x7FF8_0000_0000_0000, 0),
            penultimate_denormal64: emit_const(asm, 0x000F_FFFF_FFFF_FFFE, 0),
            min_s32: emit_const(asm, (-2147483648.0f64).to_bits(), 0),
            max_s32: emit_const(asm, 2147483647.0f64.to_bits(), 0),
            min_u32: emit_const(asm, 0.0f64.to_bits(), 0),
        };

        let trampolines = Trampolines {
            run_code,
            return_from_run_code,
            return_from_run_code_no_mxcsr: return_no_mxcsr,
            read_memory,
            write_memory,
        };
        (trampolines, consts)
    }

    /// A memory thunk receives the guest address in RDI (and the store value
    /// in RSI), preserves every caller-saved register the access does not
    /// consume, and calls the user callback with host MXCSR in effect.
    /// Reads return their result in RAX.
    fn gen_memory_thunk(asm: &mut CodeAssembler, callback: &dyn crate::backend::x64::callback::Callback, is_write: bool) -> usize {
        let offset = asm.size();

        let saved: &[HostLoc] = if is_write {
            &[HOST_RAX, HOST_RCX, HOST_RDX, HOST_R8, HOST_R9, HOST_R10, HOST_R11]
        } else {
            &[HOST_RCX, HOST_RDX, HOST_RSI, HOST_R8, HOST_R9, HOST_R10, HOST_R11]
        };
        for &loc in saved {
            asm.push(loc.to_reg64());
        }
        // 7 pushes after the call leave RSP aligned; reserve an aligned area
        // for all 16 XMM registers.
        asm.sub(RSP, 256i32);
        for i in 0..16u8 {
            asm.movaps(
                crate::backend::x64::assembler::xmmword_ptr(RegExp::from(RSP) + (i as i32) * 16),
                Reg::xmm(i),
            );
        }

        Self::emit_switch_mxcsr_on_exit(asm);
        callback.emit_call(asm, &|code, params| {
            // The thunk convention fixes vaddr in RDI and value in RSI; the
            // callback may want them shifted (value first so the moves never
            // clobber a pending source).
            if is_write && params[1].get_idx() != RSI.get_idx() {
                code.mov(params[1], RSI);
            }
            if params[0].get_idx() != RDI.get_idx() {
                code.mov(params[0], RDI);
            }
        });
        Self::emit_switch_mxcsr_on_entry(asm);

        for i in 0..16u8 {
            asm.movaps(
                Reg::xmm(i),
                crate::backend::x64::assembler::xmmword_ptr(RegExp::from(RSP) + (i as i32) * 16),
            );
        }
        asm.add(RSP, 256i32);
        for &loc in saved.iter().rev() {
            asm.pop(loc.to_reg64());
        }
        asm.ret();

        offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::x64::callback::ArgCallback;

    fn dummy_callbacks() -> UserCallbacks {
        extern "sysv64" fn nop_cb(_: u64, _: u64) {}
        let cb = || Box::new(ArgCallback::new(nop_cb as usize as u64, 0)) as Box<dyn crate::backend::x64::callback::Callback>;
        UserCallbacks {
            interpreter_fallback: cb(),
            call_svc: cb(),
            memory_read_8: cb(),
            memory_read_16: cb(),
            memory_read_32: cb(),
            memory_read_64: cb(),
            memory_write_8: cb(),
            memory_write_16: cb(),
            memory_write_32: cb(),
            memory_write_64: cb(),
        }
    }

    #[test]
    fn test_prelude_layout() {
        let callbacks = dummy_callbacks();
        let code = BlockOfCode::new(1024 * 1024, &callbacks).unwrap();
        assert_eq!(code.trampolines.run_code, 0);
        assert!(code.trampolines.return_from_run_code > 0);
        assert!(code.trampolines.return_from_run_code_no_mxcsr > code.trampolines.return_from_run_code);
        for w in 0..4 {
            assert!(code.trampolines.read_memory[w] > 0);
            assert!(code.trampolines.write_memory[w] > 0);
        }
        // Constants are 16-byte aligned and inside the prelude.
        assert_eq!(code.consts.negative_zero32 % 16, 0);
        assert!(code.consts.min_u32 < code.code_begin_offset);
    }

    #[test]
    fn test_clear_cache_keeps_prelude() {
        let callbacks = dummy_callbacks();
        let mut code = BlockOfCode::new(1024 * 1024, &callbacks).unwrap();
        let begin = code.code_begin_offset;
        code.asm.nop();
        code.asm.nop();
        assert!(code.asm.size() > begin);
        code.clear_cache();
        assert_eq!(code.asm.size(), begin);
    }

    #[test]
    fn test_run_code_round_trip() {
        // Enter run_code with a "block" that immediately takes the
        // trampoline; the guest state pointer must have reached R15.
        let callbacks = dummy_callbacks();
        let mut code = BlockOfCode::new(1024 * 1024, &callbacks).unwrap();

        let block_offset = code.asm.size();
        // mov dword [r15 + reg[0]], 0x7E57
        code.asm.mov(
            dword_ptr(RegExp::from(R15) + JitState::reg_offset(0) as i32),
            0x7E57i32,
        );
        code.asm.jmp_offset(code.trampolines.return_from_run_code);

        let mut state = JitState::new();
        let block_ptr = unsafe { code.code_base_ptr().add(block_offset) };
        unsafe { code.run_code_fn()(&mut state, block_ptr) };
        assert_eq!(state.reg[0], 0x7E57);
    }
}
