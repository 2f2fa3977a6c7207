use crate::backend::x64::assembler::Reg;
use crate::backend::x64::jit_state::SPILL_COUNT;

/// Host location: a GPR, an XMM register, or a spill slot in the guest state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostLoc {
    Gpr(u8),
    Xmm(u8),
    Spill(u8),
}

impl HostLoc {
    pub fn is_gpr(self) -> bool {
        matches!(self, HostLoc::Gpr(_))
    }

    pub fn is_xmm(self) -> bool {
        matches!(self, HostLoc::Xmm(_))
    }

    pub fn is_register(self) -> bool {
        self.is_gpr() || self.is_xmm()
    }

    pub fn is_spill(self) -> bool {
        matches!(self, HostLoc::Spill(_))
    }

    /// Widest value the location can hold, in bits.
    pub fn bit_width(self) -> usize {
        match self {
            HostLoc::Gpr(_) => 64,
            HostLoc::Xmm(_) => 128,
            HostLoc::Spill(_) => 64,
        }
    }

    pub fn gpr_index(self) -> u8 {
        match self {
            HostLoc::Gpr(i) => i,
            _ => panic!("gpr_index called on {:?}", self),
        }
    }

    pub fn xmm_index(self) -> u8 {
        match self {
            HostLoc::Xmm(i) => i,
            _ => panic!("xmm_index called on {:?}", self),
        }
    }

    pub fn spill_index(self) -> u8 {
        match self {
            HostLoc::Spill(i) => i,
            _ => panic!("spill_index called on {:?}", self),
        }
    }

    pub fn to_reg64(self) -> Reg {
        Reg::gpr64(self.gpr_index())
    }

    pub fn to_xmm(self) -> Reg {
        Reg::xmm(self.xmm_index())
    }
}

/// Convert an assembler register back to its HostLoc.
pub fn reg_to_hostloc(reg: Reg) -> HostLoc {
    if reg.is_xmm() {
        HostLoc::Xmm(reg.get_idx())
    } else {
        HostLoc::Gpr(reg.get_idx())
    }
}

pub const HOST_RAX: HostLoc = HostLoc::Gpr(0);
pub const HOST_RCX: HostLoc = HostLoc::Gpr(1);
pub const HOST_RDX: HostLoc = HostLoc::Gpr(2);
pub const HOST_RBX: HostLoc = HostLoc::Gpr(3);
pub const HOST_RSP: HostLoc = HostLoc::Gpr(4);
pub const HOST_RBP: HostLoc = HostLoc::Gpr(5);
pub const HOST_RSI: HostLoc = HostLoc::Gpr(6);
pub const HOST_RDI: HostLoc = HostLoc::Gpr(7);
pub const HOST_R8: HostLoc = HostLoc::Gpr(8);
pub const HOST_R9: HostLoc = HostLoc::Gpr(9);
pub const HOST_R10: HostLoc = HostLoc::Gpr(10);
pub const HOST_R11: HostLoc = HostLoc::Gpr(11);
pub const HOST_R12: HostLoc = HostLoc::Gpr(12);
pub const HOST_R13: HostLoc = HostLoc::Gpr(13);
pub const HOST_R14: HostLoc = HostLoc::Gpr(14);
pub const HOST_R15: HostLoc = HostLoc::Gpr(15);

/// GPRs available to the allocator.
/// Excludes RSP (stack pointer) and R15 (guest-state base pointer).
pub const ANY_GPR: &[HostLoc] = &[
    HOST_RAX, HOST_RBX, HOST_RCX, HOST_RDX,
    HOST_RSI, HOST_RDI, HOST_RBP,
    HOST_R8, HOST_R9, HOST_R10, HOST_R11,
    HOST_R12, HOST_R13, HOST_R14,
];

/// XMM registers available to the allocator.
/// Excludes XMM0, kept free as an implicit scratch.
pub const ANY_XMM: &[HostLoc] = &[
    HostLoc::Xmm(1), HostLoc::Xmm(2), HostLoc::Xmm(3),
    HostLoc::Xmm(4), HostLoc::Xmm(5), HostLoc::Xmm(6),
    HostLoc::Xmm(7), HostLoc::Xmm(8), HostLoc::Xmm(9),
    HostLoc::Xmm(10), HostLoc::Xmm(11), HostLoc::Xmm(12),
    HostLoc::Xmm(13), HostLoc::Xmm(14), HostLoc::Xmm(15),
];

const _: () = assert!(SPILL_COUNT <= u8::MAX as usize);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(HOST_RAX.is_gpr());
        assert!(HOST_RAX.is_register());
        assert!(HostLoc::Xmm(1).is_xmm());
        assert!(HostLoc::Spill(0).is_spill());
        assert!(!HostLoc::Spill(0).is_register());
    }

    #[test]
    fn test_pools_exclude_reserved() {
        assert!(!ANY_GPR.contains(&HOST_RSP));
        assert!(!ANY_GPR.contains(&HOST_R15));
        assert_eq!(ANY_GPR.len(), 14);
        assert!(!ANY_XMM.contains(&HostLoc::Xmm(0)));
        assert_eq!(ANY_XMM.len(), 15);
    }

    #[test]
    fn test_reg_round_trip() {
        assert_eq!(reg_to_hostloc(HOST_RBP.to_reg64()), HOST_RBP);
        assert_eq!(reg_to_hostloc(HostLoc::Xmm(7).to_xmm()), HostLoc::Xmm(7));
    }
}
