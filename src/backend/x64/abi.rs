use crate::backend::x64::hostloc::*;

/// System V x86-64 ABI.
///
/// Parameter registers: RDI, RSI, RDX, RCX, R8, R9
/// Return: RAX
/// Caller-saved: RAX, RCX, RDX, RDI, RSI, R8-R11, XMM0-XMM15
/// Callee-saved: RBX, RBP, R12-R15
pub const ABI_RETURN: HostLoc = HOST_RAX;

pub const ABI_PARAM_COUNT: usize = 6;

pub const ABI_PARAMS: [HostLoc; 6] = [
    HOST_RDI, HOST_RSI, HOST_RDX, HOST_RCX, HOST_R8, HOST_R9,
];

pub const CALLER_SAVE_GPRS: &[HostLoc] = &[
    HOST_RAX, HOST_RCX, HOST_RDX, HOST_RDI, HOST_RSI,
    HOST_R8, HOST_R9, HOST_R10, HOST_R11,
];

pub const CALLER_SAVE_XMMS: &[HostLoc] = &[
    HostLoc::Xmm(0), HostLoc::Xmm(1), HostLoc::Xmm(2), HostLoc::Xmm(3),
    HostLoc::Xmm(4), HostLoc::Xmm(5), HostLoc::Xmm(6), HostLoc::Xmm(7),
    HostLoc::Xmm(8), HostLoc::Xmm(9), HostLoc::Xmm(10), HostLoc::Xmm(11),
    HostLoc::Xmm(12), HostLoc::Xmm(13), HostLoc::Xmm(14), HostLoc::Xmm(15),
];

pub const CALLEE_SAVE_GPRS: &[HostLoc] = &[
    HOST_RBX, HOST_RBP, HOST_R12, HOST_R13, HOST_R14, HOST_R15,
];

pub fn abi_param(n: usize) -> HostLoc {
    assert!(n < ABI_PARAM_COUNT, "ABI param index {} out of range", n);
    ABI_PARAMS[n]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abi_params() {
        assert_eq!(abi_param(0), HOST_RDI);
        assert_eq!(abi_param(3), HOST_RCX);
    }

    #[test]
    fn test_save_sets_partition_gprs() {
        for cs in CALLEE_SAVE_GPRS {
            assert!(!CALLER_SAVE_GPRS.contains(cs));
        }
        // All 15 GPRs other than RSP are covered.
        assert_eq!(CALLER_SAVE_GPRS.len() + CALLEE_SAVE_GPRS.len(), 15);
    }
}
