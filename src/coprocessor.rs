//! Coprocessor capability interface.
//!
//! Each registered coprocessor is asked at compile time how a given
//! operation should be lowered; the answer is either "unsupported" (the
//! guest faults), a host callback, or a direct pointer to one or two
//! 32-bit cells the emitter can access with plain moves.

use crate::arm::CoprocReg;

/// A host function address plus an optional fixed first argument.
///
/// The emitted call passes `(jit_ptr, user_arg?, operands...)` in the host
/// calling convention.
#[derive(Debug, Clone, Copy)]
pub struct CoprocCallback {
    pub function: u64,
    pub user_arg: Option<u64>,
}

/// How a coprocessor word transfer compiles.
pub enum CoprocAction {
    /// Call into the coprocessor implementation at run time.
    Callback(CoprocCallback),
    /// Access a single 32-bit cell directly.
    OneCell(*mut u32),
    /// Access two 32-bit cells directly (low word first).
    TwoCells([*mut u32; 2]),
}

/// Compile-time interface of a guest coprocessor (CP0-CP15).
///
/// Every method returns `None` when the operation is unsupported, which the
/// emitter turns into a guest undefined-instruction fault.
pub trait Coprocessor {
    fn compile_internal_operation(
        &self,
        two: bool,
        opc1: u32,
        crd: CoprocReg,
        crn: CoprocReg,
        crm: CoprocReg,
        opc2: u32,
    ) -> Option<CoprocCallback>;

    fn compile_send_one_word(
        &self,
        two: bool,
        opc1: u32,
        crn: CoprocReg,
        crm: CoprocReg,
        opc2: u32,
    ) -> Option<CoprocAction>;

    fn compile_send_two_words(&self, two: bool, opc: u32, crm: CoprocReg) -> Option<CoprocAction>;

    fn compile_get_one_word(
        &self,
        two: bool,
        opc1: u32,
        crn: CoprocReg,
        crm: CoprocReg,
        opc2: u32,
    ) -> Option<CoprocAction>;

    fn compile_get_two_words(&self, two: bool, opc: u32, crm: CoprocReg) -> Option<CoprocAction>;

    fn compile_load_words(
        &self,
        two: bool,
        long_transfer: bool,
        crd: CoprocReg,
        option: Option<u8>,
    ) -> Option<CoprocCallback>;

    fn compile_store_words(
        &self,
        two: bool,
        long_transfer: bool,
        crd: CoprocReg,
        option: Option<u8>,
    ) -> Option<CoprocCallback>;
}
