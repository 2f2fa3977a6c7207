use std::fmt;

use crate::ir::opcode::Opcode;
use crate::ir::types::Type;
use crate::ir::value::Value;

/// Maximum number of arguments per IR instruction.
pub const MAX_ARGS: usize = 4;

/// A single IR micro-instruction.
///
/// Instructions live in the block's arena; `use_count` is the number of
/// remaining consumers, maintained by block construction and decremented by
/// the register allocator as consumers are lowered.
#[derive(Debug, Clone)]
pub struct Inst {
    pub opcode: Opcode,
    pub args: [Value; MAX_ARGS],
    pub use_count: u32,
}

impl Inst {
    pub fn new(opcode: Opcode, args: &[Value]) -> Self {
        assert!(
            args.len() == opcode.num_args(),
            "Opcode {} takes {} args, got {}",
            opcode,
            opcode.num_args(),
            args.len()
        );
        let mut inst_args = [Value::Void; MAX_ARGS];
        for (i, arg) in args.iter().enumerate() {
            assert!(
                arg.get_type().is_compatible_with(opcode.arg_types()[i]),
                "Opcode {} arg {}: expected {}, got {}",
                opcode,
                i,
                opcode.arg_types()[i],
                arg.get_type()
            );
            inst_args[i] = *arg;
        }
        Self {
            opcode,
            args: inst_args,
            use_count: 0,
        }
    }

    pub fn return_type(&self) -> Type {
        self.opcode.return_type()
    }

    pub fn num_args(&self) -> usize {
        self.opcode.num_args()
    }

    pub fn arg(&self, idx: usize) -> Value {
        self.args[idx]
    }

    /// Tombstoned instructions stay in the arena (so InstRefs remain stable)
    /// but are skipped by iteration.
    pub fn is_tombstone(&self) -> bool {
        self.opcode == Opcode::Void
    }

    pub fn tombstone(&mut self) {
        self.opcode = Opcode::Void;
        self.args = [Value::Void; MAX_ARGS];
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        for i in 0..self.num_args() {
            if i == 0 {
                write!(f, " ")?;
            } else {
                write!(f, ", ")?;
            }
            write!(f, "{}", self.args[i])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::value::InstRef;

    #[test]
    fn test_inst_creation() {
        let inst = Inst::new(
            Opcode::AddWithCarry,
            &[
                Value::Inst(InstRef(0)),
                Value::Inst(InstRef(1)),
                Value::ImmU1(false),
            ],
        );
        assert_eq!(inst.opcode, Opcode::AddWithCarry);
        assert_eq!(inst.num_args(), 3);
        assert_eq!(inst.use_count, 0);
    }

    #[test]
    #[should_panic(expected = "takes 3 args")]
    fn test_inst_arity_mismatch() {
        let _ = Inst::new(Opcode::AddWithCarry, &[Value::ImmU32(1)]);
    }

    #[test]
    #[should_panic(expected = "expected U1")]
    fn test_inst_type_mismatch() {
        let _ = Inst::new(
            Opcode::AddWithCarry,
            &[Value::ImmU32(1), Value::ImmU32(2), Value::ImmU32(3)],
        );
    }

    #[test]
    fn test_tombstone() {
        let mut inst = Inst::new(Opcode::GetCpsr, &[]);
        assert!(!inst.is_tombstone());
        inst.tombstone();
        assert!(inst.is_tombstone());
    }
}
