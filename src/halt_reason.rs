use bitflags::bitflags;

bitflags! {
    /// Reasons the host asked emitted code to stop.
    ///
    /// The dispatcher stores these into `JitState::halt_requested`; emitted
    /// code polls the byte at `CheckHalt` terminals and at cycle checks.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HaltReason: u8 {
        /// External halt requested (e.g. from the scheduler).
        const EXTERNAL_HALT      = 1 << 0;
        /// Cache invalidation requested; emitted code must not be re-entered.
        const CACHE_INVALIDATION = 1 << 1;
        /// Single-step completed.
        const STEP               = 1 << 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halt_reason_bits() {
        let reason = HaltReason::EXTERNAL_HALT | HaltReason::STEP;
        assert!(reason.contains(HaltReason::EXTERNAL_HALT));
        assert!(!reason.contains(HaltReason::CACHE_INVALIDATION));
        assert_eq!(HaltReason::empty().bits(), 0);
    }
}
