use std::cell::RefCell;

use crate::backend::x64::block_cache::BlockRegistry;
use crate::backend::x64::block_of_code::{CpuFeatures, FloatConstants, Trampolines};
use crate::backend::x64::patch_info::{PatchEntry, PatchType};
use crate::config::UserConfig;
use crate::ir::location::LocationDescriptor;

/// Everything a lowering needs besides the register allocator: the block's
/// identity and FPSCR mode, the host configuration, prelude offsets, and the
/// patch-site ledger for the block being emitted.
pub struct EmitContext<'a> {
    pub block_location: LocationDescriptor,
    pub config: &'a UserConfig,
    pub registry: &'a BlockRegistry,
    pub consts: FloatConstants,
    pub cpu: CpuFeatures,
    pub trampolines: Trampolines,
    pub code_base: *const u8,
    patch_entries: RefCell<Vec<PatchEntry>>,
}

impl<'a> EmitContext<'a> {
    pub fn new(
        block_location: LocationDescriptor,
        config: &'a UserConfig,
        registry: &'a BlockRegistry,
        consts: FloatConstants,
        cpu: CpuFeatures,
        trampolines: Trampolines,
        code_base: *const u8,
    ) -> Self {
        Self {
            block_location,
            config,
            registry,
            consts,
            cpu,
            trampolines,
            code_base,
            patch_entries: RefCell::new(Vec::new()),
        }
    }

    /// Flush-to-zero mode for this block.
    pub fn ftz(&self) -> bool {
        self.block_location.fpscr_ftz()
    }

    /// Default-NaN mode for this block.
    pub fn dn(&self) -> bool {
        self.block_location.fpscr_dn()
    }

    /// FPSCR rounding mode for this block (0=RN, 1=RP, 2=RM, 3=RZ).
    pub fn rmode(&self) -> u32 {
        self.block_location.fpscr_rmode()
    }

    /// Record a patch site beginning at `code_offset`.
    pub fn add_patch(&self, target_hash: u64, patch_type: PatchType, code_offset: usize) {
        self.patch_entries.borrow_mut().push(PatchEntry {
            target_hash,
            patch_type,
            code_offset,
        });
    }

    pub fn take_patch_entries(&self) -> Vec<PatchEntry> {
        self.patch_entries.borrow_mut().drain(..).collect()
    }

    /// Entry point offset of an already-emitted block, if any.
    pub fn target_code_offset(&self, target_hash: u64) -> Option<usize> {
        self.registry.get(target_hash).map(|d| d.entrypoint_offset)
    }

    /// Absolute address of the dispatcher-return trampoline.
    pub fn return_from_run_code_address(&self) -> u64 {
        self.code_base as u64 + self.trampolines.return_from_run_code as u64
    }
}
