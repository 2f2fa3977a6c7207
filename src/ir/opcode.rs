use std::fmt;

use crate::ir::types::Type;

/// Declares the opcode enum together with each opcode's result type and
/// argument signature, so the three stay in one table.
macro_rules! opcodes {
    ($($name:ident: $ret:ident [$($arg:ident),*]),* $(,)?) => {
        /// IR micro-instruction opcodes.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $($name,)*
        }

        impl Opcode {
            /// Result type of this operation.
            pub fn return_type(self) -> Type {
                match self {
                    $(Opcode::$name => Type::$ret,)*
                }
            }

            /// Declared argument types.
            pub fn arg_types(self) -> &'static [Type] {
                match self {
                    $(Opcode::$name => &[$(Type::$arg),*],)*
                }
            }

            fn name(self) -> &'static str {
                match self {
                    $(Opcode::$name => stringify!($name),)*
                }
            }
        }
    };
}

opcodes! {
    Void: Void [],
    Identity: Opaque [Opaque],
    Breakpoint: Void [],

    // Guest register and flag access
    GetRegister: U32 [RegRef],
    SetRegister: Void [RegRef, U32],
    GetExtendedRegister32: F32 [ExtRegRef],
    SetExtendedRegister32: Void [ExtRegRef, F32],
    GetExtendedRegister64: F64 [ExtRegRef],
    SetExtendedRegister64: Void [ExtRegRef, F64],
    GetCpsr: U32 [],
    SetCpsr: Void [U32],
    GetNFlag: U1 [],
    SetNFlag: Void [U1],
    GetZFlag: U1 [],
    SetZFlag: Void [U1],
    GetCFlag: U1 [],
    SetCFlag: Void [U1],
    GetVFlag: U1 [],
    SetVFlag: Void [U1],
    OrQFlag: Void [U1],
    GetGEFlags: U32 [],
    SetGEFlags: Void [U32],
    BXWritePC: Void [U32],
    CallSupervisor: Void [U32],
    GetFpscr: U32 [],
    SetFpscr: Void [U32],
    GetFpscrNZCV: U32 [],
    SetFpscrNZCV: Void [U32],

    // Return stack buffer
    PushRSB: Void [U64],

    // Pseudo-operations, consumed by their parent's lowering
    GetCarryFromOp: U1 [Opaque],
    GetOverflowFromOp: U1 [Opaque],
    GetGEFromOp: U32 [Opaque],

    // Data movement and casts
    Pack2x32To1x64: U64 [U32, U32],
    LeastSignificantWord: U32 [U64],
    MostSignificantWord: U32 [U64],
    LeastSignificantHalf: U16 [U32],
    LeastSignificantByte: U8 [U32],
    MostSignificantBit: U1 [U32],
    IsZero: U1 [U32],
    IsZero64: U1 [U64],

    // Shifts
    LogicalShiftLeft: U32 [U32, U8, U1],
    LogicalShiftRight: U32 [U32, U8, U1],
    LogicalShiftRight64: U64 [U64, U8],
    ArithmeticShiftRight: U32 [U32, U8, U1],
    RotateRight: U32 [U32, U8, U1],
    RotateRightExtended: U32 [U32, U1],

    // Arithmetic
    AddWithCarry: U32 [U32, U32, U1],
    SubWithCarry: U32 [U32, U32, U1],
    Add64: U64 [U64, U64],
    Sub64: U64 [U64, U64],
    Mul: U32 [U32, U32],
    Mul64: U64 [U64, U64],

    // Bitwise
    And: U32 [U32, U32],
    Eor: U32 [U32, U32],
    Or: U32 [U32, U32],
    Not: U32 [U32],

    // Extensions
    SignExtendWordToLong: U64 [U32],
    SignExtendHalfToWord: U32 [U16],
    SignExtendByteToWord: U32 [U8],
    ZeroExtendWordToLong: U64 [U32],
    ZeroExtendHalfToWord: U32 [U16],
    ZeroExtendByteToWord: U32 [U8],

    // Bit utilities
    ByteReverseWord: U32 [U32],
    ByteReverseHalf: U16 [U16],
    ByteReverseDual: U64 [U64],
    CountLeadingZeros: U32 [U32],

    // Saturation
    SignedSaturatedAdd: U32 [U32, U32],
    SignedSaturatedSub: U32 [U32, U32],
    UnsignedSaturation: U32 [U32, U8],
    SignedSaturation: U32 [U32, U8],

    // Packed (SIMD-in-GPR)
    PackedAddU8: U32 [U32, U32],
    PackedAddS8: U32 [U32, U32],
    PackedAddU16: U32 [U32, U32],
    PackedAddS16: U32 [U32, U32],
    PackedSubU8: U32 [U32, U32],
    PackedSubS8: U32 [U32, U32],
    PackedSubU16: U32 [U32, U32],
    PackedSubS16: U32 [U32, U32],
    PackedHalvingAddU8: U32 [U32, U32],
    PackedHalvingAddS8: U32 [U32, U32],
    PackedHalvingAddU16: U32 [U32, U32],
    PackedHalvingAddS16: U32 [U32, U32],
    PackedHalvingSubU8: U32 [U32, U32],
    PackedHalvingSubS8: U32 [U32, U32],
    PackedHalvingSubU16: U32 [U32, U32],
    PackedHalvingSubS16: U32 [U32, U32],
    PackedHalvingSubAddU16: U32 [U32, U32, U1],
    PackedHalvingSubAddS16: U32 [U32, U32, U1],
    PackedSaturatedAddU8: U32 [U32, U32],
    PackedSaturatedAddS8: U32 [U32, U32],
    PackedSaturatedAddU16: U32 [U32, U32],
    PackedSaturatedAddS16: U32 [U32, U32],
    PackedSaturatedSubU8: U32 [U32, U32],
    PackedSaturatedSubS8: U32 [U32, U32],
    PackedSaturatedSubU16: U32 [U32, U32],
    PackedSaturatedSubS16: U32 [U32, U32],
    PackedAbsDiffSumS8: U32 [U32, U32],

    // GPR <-> FP transfers
    TransferToFP32: F32 [U32],
    TransferFromFP32: U32 [F32],
    TransferToFP64: F64 [U64],
    TransferFromFP64: U64 [F64],

    // Floating point
    FPAbs32: F32 [F32],
    FPAbs64: F64 [F64],
    FPNeg32: F32 [F32],
    FPNeg64: F64 [F64],
    FPAdd32: F32 [F32, F32],
    FPAdd64: F64 [F64, F64],
    FPSub32: F32 [F32, F32],
    FPSub64: F64 [F64, F64],
    FPMul32: F32 [F32, F32],
    FPMul64: F64 [F64, F64],
    FPDiv32: F32 [F32, F32],
    FPDiv64: F64 [F64, F64],
    FPSqrt32: F32 [F32],
    FPSqrt64: F64 [F64],
    FPCompare32: Void [F32, F32, U1],
    FPCompare64: Void [F64, F64, U1],

    // FP conversions (integer results travel in FP registers)
    FPSingleToDouble: F64 [F32],
    FPDoubleToSingle: F32 [F64],
    FPSingleToS32: F32 [F32, U1],
    FPSingleToU32: F32 [F32, U1],
    FPDoubleToS32: F32 [F64, U1],
    FPDoubleToU32: F32 [F64, U1],
    FPS32ToSingle: F32 [F32, U1],
    FPU32ToSingle: F32 [F32, U1],
    FPS32ToDouble: F64 [F32, U1],
    FPU32ToDouble: F64 [F32, U1],

    // Memory
    ClearExclusive: Void [],
    SetExclusive: Void [U32, U8],
    ReadMemory8: U8 [U32],
    ReadMemory16: U16 [U32],
    ReadMemory32: U32 [U32],
    ReadMemory64: U64 [U32],
    WriteMemory8: Void [U32, U8],
    WriteMemory16: Void [U32, U16],
    WriteMemory32: Void [U32, U32],
    WriteMemory64: Void [U32, U64],
    ExclusiveWriteMemory8: U32 [U32, U8],
    ExclusiveWriteMemory16: U32 [U32, U16],
    ExclusiveWriteMemory32: U32 [U32, U32],
    ExclusiveWriteMemory64: U32 [U32, U32, U32],

    // Coprocessor
    CoprocInternalOperation: Void [CoprocInfo],
    CoprocSendOneWord: Void [CoprocInfo, U32],
    CoprocSendTwoWords: Void [CoprocInfo, U32, U32],
    CoprocGetOneWord: U32 [CoprocInfo],
    CoprocGetTwoWords: U64 [CoprocInfo],
    CoprocLoadWords: Void [CoprocInfo, U32],
    CoprocStoreWords: Void [CoprocInfo, U32],
}

impl Opcode {
    pub fn num_args(self) -> usize {
        self.arg_types().len()
    }

    /// Pseudo-ops name a flag side-effect of a preceding producer. They are
    /// consumed by the producer's lowering and never lowered standalone.
    pub fn is_pseudo_op(self) -> bool {
        matches!(
            self,
            Opcode::GetCarryFromOp | Opcode::GetOverflowFromOp | Opcode::GetGEFromOp
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signatures() {
        assert_eq!(Opcode::AddWithCarry.num_args(), 3);
        assert_eq!(Opcode::AddWithCarry.return_type(), Type::U32);
        assert_eq!(Opcode::GetRegister.arg_types(), &[Type::RegRef]);
        assert_eq!(Opcode::ExclusiveWriteMemory64.num_args(), 3);
        assert_eq!(Opcode::GetCpsr.num_args(), 0);
    }

    #[test]
    fn test_pseudo_ops() {
        assert!(Opcode::GetCarryFromOp.is_pseudo_op());
        assert!(Opcode::GetGEFromOp.is_pseudo_op());
        assert!(!Opcode::AddWithCarry.is_pseudo_op());
    }
}
