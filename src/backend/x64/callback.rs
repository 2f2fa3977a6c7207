use crate::backend::x64::abi;
use crate::backend::x64::assembler::{CodeAssembler, Reg, RAX};

/// A host function callable from emitted code.
///
/// The emitter invokes callbacks for everything the guest cannot do on its
/// own: memory access, SVCs, the interpreter fallback, coprocessors.
pub trait Callback {
    /// Emit a call. `setup` receives the ABI parameter registers available
    /// to the caller so it can place arguments before the call instruction.
    fn emit_call(&self, code: &mut CodeAssembler, setup: &dyn Fn(&mut CodeAssembler, &[Reg]));

    /// Emit a call with no argument setup.
    fn emit_call_simple(&self, code: &mut CodeAssembler) {
        self.emit_call(code, &|_, _| {});
    }
}

/// A callback wrapping a bare function pointer.
pub struct SimpleCallback {
    fn_ptr: u64,
}

impl SimpleCallback {
    pub fn new(fn_ptr: u64) -> Self {
        Self { fn_ptr }
    }
}

impl Callback for SimpleCallback {
    fn emit_call(&self, code: &mut CodeAssembler, setup: &dyn Fn(&mut CodeAssembler, &[Reg])) {
        let params: Vec<Reg> = abi::ABI_PARAMS.iter().take(4).map(|h| h.to_reg64()).collect();
        setup(code, &params);
        emit_call_to(code, self.fn_ptr);
    }
}

/// A callback that passes a fixed u64 as the first parameter, shifting the
/// caller's arguments right by one. Used to smuggle a context pointer to
/// host functions.
pub struct ArgCallback {
    fn_ptr: u64,
    arg: u64,
}

impl ArgCallback {
    pub fn new(fn_ptr: u64, arg: u64) -> Self {
        Self { fn_ptr, arg }
    }
}

impl Callback for ArgCallback {
    fn emit_call(&self, code: &mut CodeAssembler, setup: &dyn Fn(&mut CodeAssembler, &[Reg])) {
        let remaining: Vec<Reg> = abi::ABI_PARAMS.iter().skip(1).take(3).map(|h| h.to_reg64()).collect();
        setup(code, &remaining);
        let param1 = abi::ABI_PARAMS[0].to_reg64();
        code.mov(param1, self.arg as i64);
        emit_call_to(code, self.fn_ptr);
    }
}

/// Call an absolute address: `mov rax, imm64; call rax`.
fn emit_call_to(code: &mut CodeAssembler, address: u64) {
    code.mov_abs64(RAX, address);
    code.call_reg(RAX);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_callback_emits_indirect_call() {
        let mut asm = CodeAssembler::new(4096).unwrap();
        SimpleCallback::new(0x1122_3344_5566_7788).emit_call_simple(&mut asm);
        // mov rax, imm64 (10 bytes) + call rax (2 bytes)
        assert_eq!(asm.size(), 12);
        assert_eq!(&asm.bytes()[10..], &[0xFF, 0xD0]);
    }

    #[test]
    fn test_arg_callback_loads_first_param() {
        let mut asm = CodeAssembler::new(4096).unwrap();
        ArgCallback::new(0x1000, 0x42).emit_call_simple(&mut asm);
        // mov rdi, 0x42 is the first instruction (REX.W C7 C7 42 00 00 00).
        assert_eq!(&asm.bytes()[..7], &[0x48, 0xC7, 0xC7, 0x42, 0x00, 0x00, 0x00]);
    }
}
