//! Guest-visible ARM register names used by IR immediates.

use std::fmt;

/// A32 general-purpose register (R0-R15).
/// R13 = SP, R14 = LR, R15 = PC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    R0 = 0, R1, R2, R3, R4, R5, R6, R7,
    R8, R9, R10, R11, R12, R13, R14, R15,
}

impl Reg {
    pub const SP: Reg = Reg::R13;
    pub const LR: Reg = Reg::R14;
    pub const PC: Reg = Reg::R15;

    pub fn number(self) -> usize {
        self as usize
    }

    pub fn from_u8(val: u8) -> Self {
        assert!(val <= 15, "Invalid A32 register number: {}", val);
        match val {
            0 => Reg::R0, 1 => Reg::R1, 2 => Reg::R2, 3 => Reg::R3,
            4 => Reg::R4, 5 => Reg::R5, 6 => Reg::R6, 7 => Reg::R7,
            8 => Reg::R8, 9 => Reg::R9, 10 => Reg::R10, 11 => Reg::R11,
            12 => Reg::R12, 13 => Reg::R13, 14 => Reg::R14, _ => Reg::R15,
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Reg::R13 => write!(f, "SP"),
            Reg::R14 => write!(f, "LR"),
            Reg::R15 => write!(f, "PC"),
            r => write!(f, "R{}", r as u8),
        }
    }
}

/// A32 extension register — S (single) or D (double).
/// S0-S1 occupy the same storage as D0, S2-S3 as D1, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExtReg {
    S0 = 0, S1, S2, S3, S4, S5, S6, S7,
    S8, S9, S10, S11, S12, S13, S14, S15,
    S16, S17, S18, S19, S20, S21, S22, S23,
    S24, S25, S26, S27, S28, S29, S30, S31,

    D0 = 32, D1, D2, D3, D4, D5, D6, D7,
    D8, D9, D10, D11, D12, D13, D14, D15,
    D16, D17, D18, D19, D20, D21, D22, D23,
    D24, D25, D26, D27, D28, D29, D30, D31,
}

impl ExtReg {
    pub fn is_single(self) -> bool {
        (self as u8) < 32
    }

    pub fn is_double(self) -> bool {
        (self as u8) >= 32
    }

    /// Index within its category (S0..S31 or D0..D31).
    pub fn index(self) -> usize {
        let v = self as u8;
        if v < 32 { v as usize } else { (v - 32) as usize }
    }

    pub fn from_single(n: u8) -> Self {
        assert!(n < 32, "Invalid single register: S{}", n);
        unsafe { std::mem::transmute(n) }
    }

    pub fn from_double(n: u8) -> Self {
        assert!(n < 32, "Invalid double register: D{}", n);
        unsafe { std::mem::transmute(n + 32) }
    }

    /// Byte offset of the backing storage within the `ext_reg` array
    /// (u32 units: S registers are one element, D registers two).
    pub fn backing_index(self) -> usize {
        if self.is_single() {
            self.index()
        } else {
            self.index() * 2
        }
    }
}

impl fmt::Display for ExtReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single() {
            write!(f, "S{}", self.index())
        } else {
            write!(f, "D{}", self.index())
        }
    }
}

/// Coprocessor register name (CRn/CRm/CRd fields).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CoprocReg {
    C0 = 0, C1, C2, C3, C4, C5, C6, C7,
    C8, C9, C10, C11, C12, C13, C14, C15,
}

impl CoprocReg {
    pub fn from_u8(val: u8) -> Self {
        assert!(val <= 15, "Invalid coprocessor register: {}", val);
        unsafe { std::mem::transmute(val) }
    }
}

impl fmt::Display for CoprocReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", *self as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reg_names() {
        assert_eq!(format!("{}", Reg::R3), "R3");
        assert_eq!(format!("{}", Reg::PC), "PC");
        assert_eq!(Reg::from_u8(13), Reg::SP);
    }

    #[test]
    fn test_ext_reg_backing() {
        assert_eq!(ExtReg::from_single(5).backing_index(), 5);
        assert_eq!(ExtReg::from_double(3).backing_index(), 6);
        assert!(ExtReg::S31.is_single());
        assert!(ExtReg::D0.is_double());
    }
}
