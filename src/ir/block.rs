use std::fmt;

use crate::ir::cond::Cond;
use crate::ir::inst::Inst;
use crate::ir::location::LocationDescriptor;
use crate::ir::opcode::Opcode;
use crate::ir::terminal::Terminal;
use crate::ir::types::Type;
use crate::ir::value::{InstRef, Value};

/// An IR basic block: a predicated, straight-line instruction sequence
/// ending in exactly one terminal.
///
/// Instructions are stored in a `Vec<Inst>` arena indexed by `InstRef`.
/// Removal (pseudo-op erasure during lowering) is done by tombstoning so
/// that outstanding `InstRef`s stay valid.
#[derive(Debug, Clone)]
pub struct Block {
    /// Identity of the first guest instruction; block-registry key.
    pub location: LocationDescriptor,
    /// Condition the whole block is predicated on.
    pub cond: Cond,
    /// Where execution continues when the predicate fails.
    pub cond_failed_location: Option<LocationDescriptor>,
    /// Cycles charged on predicate failure.
    pub cond_failed_cycle_count: u64,
    /// Instruction arena.
    instructions: Vec<Inst>,
    terminal: Terminal,
    /// Cycles charged when the block body executes.
    pub cycle_count: u64,
}

impl Block {
    pub fn new(location: LocationDescriptor) -> Self {
        Self {
            location,
            cond: Cond::AL,
            cond_failed_location: None,
            cond_failed_cycle_count: 0,
            instructions: Vec::new(),
            terminal: Terminal::Invalid,
            cycle_count: 0,
        }
    }

    /// Append an instruction, bumping the use count of every instruction
    /// argument. The argument types are checked against the opcode signature.
    pub fn append(&mut self, opcode: Opcode, args: &[Value]) -> InstRef {
        for arg in args {
            if let Value::Inst(r) = arg {
                assert!(
                    r.index() < self.instructions.len(),
                    "Argument {} references an instruction after its use",
                    r
                );
                self.instructions[r.index()].use_count += 1;
            }
        }
        let inst = Inst::new(opcode, args);
        let r = InstRef(self.instructions.len() as u32);
        self.instructions.push(inst);
        r
    }

    pub fn get(&self, r: InstRef) -> &Inst {
        &self.instructions[r.index()]
    }

    pub fn get_mut(&mut self, r: InstRef) -> &mut Inst {
        &mut self.instructions[r.index()]
    }

    pub fn inst_count(&self) -> usize {
        self.instructions.len()
    }

    pub fn instructions(&self) -> &[Inst] {
        &self.instructions
    }

    /// Set the terminal. May only be done once.
    pub fn set_terminal(&mut self, terminal: Terminal) {
        assert!(
            self.terminal.is_invalid(),
            "Block terminal has already been set"
        );
        self.terminal = terminal;
    }

    pub fn terminal(&self) -> &Terminal {
        &self.terminal
    }

    /// Find the live pseudo-op of kind `opcode` attached to `parent`, if any.
    ///
    /// A pseudo-op references its parent as argument 0 and each parent has at
    /// most one pseudo-op of a given kind.
    pub fn associated_pseudo_op(&self, parent: InstRef, opcode: Opcode) -> Option<InstRef> {
        debug_assert!(opcode.is_pseudo_op());
        for (i, inst) in self.instructions.iter().enumerate() {
            if inst.opcode == opcode && inst.args[0] == Value::Inst(parent) {
                return Some(InstRef(i as u32));
            }
        }
        None
    }

    /// Remove a pseudo-op from the instruction list once its parent's
    /// lowering has taken responsibility for producing its result.
    ///
    /// The caller must separately inform the register allocator that the
    /// parent lost the pseudo-op's use of it.
    pub fn erase_pseudo_op(&mut self, pseudo: InstRef) {
        let inst = &mut self.instructions[pseudo.index()];
        assert!(inst.opcode.is_pseudo_op(), "{} is not a pseudo-op", inst.opcode);
        inst.tombstone();
    }

    /// Replace every use of `target` with `replacement` and tombstone it.
    /// Used when a lowering proves a pseudo-op result constant
    /// (e.g. SignedSaturation with N == 32 never overflows).
    pub fn replace_uses_with(&mut self, target: InstRef, replacement: Value) {
        let mut replaced = 0u32;
        for inst in &mut self.instructions {
            for i in 0..inst.num_args() {
                if inst.args[i] == Value::Inst(target) {
                    inst.args[i] = replacement;
                    replaced += 1;
                }
            }
        }
        if let Value::Inst(new_ref) = replacement {
            self.instructions[new_ref.index()].use_count += replaced;
        }
        self.instructions[target.index()].use_count = 0;
        self.instructions[target.index()].tombstone();
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Block {} (cond {}, cycles {}):", self.location, self.cond, self.cycle_count)?;
        for (i, inst) in self.instructions.iter().enumerate() {
            if inst.is_tombstone() {
                continue;
            }
            if inst.return_type() != Type::Void {
                writeln!(f, "  {} = {}", InstRef(i as u32), inst)?;
            } else {
                writeln!(f, "  {}", inst)?;
            }
        }
        writeln!(f, "  terminal: {}", self.terminal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::Reg;

    #[test]
    fn test_append_tracks_uses() {
        let mut block = Block::new(LocationDescriptor::at(0x1000));
        let a = block.append(Opcode::GetRegister, &[Value::ImmRegRef(Reg::R1)]);
        let b = block.append(Opcode::GetRegister, &[Value::ImmRegRef(Reg::R2)]);
        let sum = block.append(
            Opcode::AddWithCarry,
            &[Value::Inst(a), Value::Inst(b), Value::ImmU1(false)],
        );
        block.append(Opcode::SetRegister, &[Value::ImmRegRef(Reg::R0), Value::Inst(sum)]);

        assert_eq!(block.get(a).use_count, 1);
        assert_eq!(block.get(b).use_count, 1);
        assert_eq!(block.get(sum).use_count, 1);
    }

    #[test]
    fn test_pseudo_op_lookup_and_erase() {
        let mut block = Block::new(LocationDescriptor::at(0));
        let a = block.append(Opcode::GetRegister, &[Value::ImmRegRef(Reg::R0)]);
        let shift = block.append(
            Opcode::LogicalShiftLeft,
            &[Value::Inst(a), Value::ImmU8(1), Value::ImmU1(false)],
        );
        let carry = block.append(Opcode::GetCarryFromOp, &[Value::Inst(shift)]);

        assert_eq!(
            block.associated_pseudo_op(shift, Opcode::GetCarryFromOp),
            Some(carry)
        );
        assert_eq!(block.associated_pseudo_op(shift, Opcode::GetOverflowFromOp), None);

        block.erase_pseudo_op(carry);
        assert_eq!(block.associated_pseudo_op(shift, Opcode::GetCarryFromOp), None);
    }

    #[test]
    #[should_panic(expected = "already been set")]
    fn test_terminal_set_once() {
        let mut block = Block::new(LocationDescriptor::at(0));
        block.set_terminal(Terminal::ReturnToDispatch);
        block.set_terminal(Terminal::ReturnToDispatch);
    }

    #[test]
    fn test_replace_uses_with_constant() {
        let mut block = Block::new(LocationDescriptor::at(0));
        let a = block.append(Opcode::GetRegister, &[Value::ImmRegRef(Reg::R0)]);
        let sat = block.append(Opcode::SignedSaturation, &[Value::Inst(a), Value::ImmU8(32)]);
        let ovf = block.append(Opcode::GetOverflowFromOp, &[Value::Inst(sat)]);
        block.append(Opcode::OrQFlag, &[Value::Inst(ovf)]);

        block.replace_uses_with(ovf, Value::ImmU1(false));
        assert!(block.get(ovf).is_tombstone());
        assert_eq!(block.get(InstRef(3)).args[0], Value::ImmU1(false));
    }
}
