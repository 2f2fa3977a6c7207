//! Per-block register allocator.
//!
//! Single-pass and consumer-count based: every IR value carries the number
//! of its remaining uses, each lowered consumer decrements it, and a value
//! dies exactly when the count reaches zero at the end of an allocation
//! scope. Values live in host GPRs, XMM registers, or spill slots inside
//! the guest state (`JitState::spill`, addressed off R15).
//!
//! Lowerings must perform all allocator calls before emitting instructions
//! that modify the returned registers; the allocator may itself emit moves,
//! exchanges, spills and reloads during those calls.

use crate::backend::x64::abi;
use crate::backend::x64::assembler::{
    dword_ptr, qword_ptr, CodeAssembler, Reg, RegExp, R15,
};
use crate::backend::x64::hostloc::*;
use crate::backend::x64::jit_state::{JitState, SPILL_COUNT};
use crate::ir::block::Block;
use crate::ir::inst::{Inst, MAX_ARGS};
use crate::ir::types::Type;
use crate::ir::value::{InstRef, Value};

const NUM_GPRS: usize = 16;
const NUM_XMMS: usize = 16;
const NON_SPILL_COUNT: usize = NUM_GPRS + NUM_XMMS;
const TOTAL_HOSTLOC_COUNT: usize = NON_SPILL_COUNT + SPILL_COUNT;

fn hostloc_to_index(loc: HostLoc) -> usize {
    match loc {
        HostLoc::Gpr(i) => i as usize,
        HostLoc::Xmm(i) => NUM_GPRS + i as usize,
        HostLoc::Spill(i) => NON_SPILL_COUNT + i as usize,
    }
}

fn index_to_hostloc(index: usize) -> HostLoc {
    if index < NUM_GPRS {
        HostLoc::Gpr(index as u8)
    } else if index < NON_SPILL_COUNT {
        HostLoc::Xmm((index - NUM_GPRS) as u8)
    } else {
        HostLoc::Spill((index - NON_SPILL_COUNT) as u8)
    }
}

// ---------------------------------------------------------------------------
// Tracking state
// ---------------------------------------------------------------------------

/// Per-instruction liveness entry.
#[derive(Debug, Clone, Copy)]
struct InstEntry {
    /// Consumers not yet lowered. Adjusted by pseudo-op erasure.
    remaining_uses: u32,
    /// Uses consumed by the instruction currently being lowered; folded into
    /// `remaining_uses` at the end of the allocation scope.
    this_scope_uses: u32,
    bit_width: usize,
}

/// Lock and content state of one host location.
#[derive(Debug, Clone, Default)]
struct HostLocInfo {
    /// Lock depth within the current allocation scope.
    lock_count: usize,
    /// Write-locked: contents may be destroyed by the current instruction.
    is_scratch: bool,
    /// IR values stored here. More than one only through result aliasing.
    values: Vec<InstRef>,
    max_bit_width: usize,
}

impl HostLocInfo {
    fn is_locked(&self) -> bool {
        self.lock_count > 0
    }

    fn is_empty(&self) -> bool {
        self.values.is_empty() && !self.is_scratch
    }

    fn read_lock(&mut self) {
        self.lock_count += 1;
    }

    fn write_lock(&mut self) {
        self.is_scratch = true;
        self.lock_count += 1;
    }

    fn add_value(&mut self, inst: InstRef, bit_width: usize) {
        self.values.push(inst);
        if bit_width > self.max_bit_width {
            self.max_bit_width = bit_width;
        }
    }
}

// ---------------------------------------------------------------------------
// Argument
// ---------------------------------------------------------------------------

/// An argument extracted from an IR instruction for allocation. Every
/// non-void argument must be consumed by exactly one allocator call.
pub struct Argument {
    allocated: bool,
    pub value: Value,
}

impl Argument {
    fn new() -> Self {
        Self {
            allocated: false,
            value: Value::Void,
        }
    }

    pub fn get_type(&self) -> Type {
        self.value.get_type()
    }

    pub fn is_immediate(&self) -> bool {
        self.value.is_immediate()
    }

    pub fn is_void(&self) -> bool {
        matches!(self.value, Value::Void)
    }

    pub fn fits_in_immediate_s32(&self) -> bool {
        if !self.is_immediate() {
            return false;
        }
        let v = self.value.get_imm_as_s64();
        (i32::MIN as i64..=i32::MAX as i64).contains(&v)
    }

    pub fn get_immediate_u1(&self) -> bool {
        self.value.get_u1()
    }

    pub fn get_immediate_u8(&self) -> u8 {
        self.value.get_u8()
    }

    pub fn get_immediate_u32(&self) -> u32 {
        self.value.get_u32()
    }

    pub fn get_immediate_u64(&self) -> u64 {
        self.value.get_imm_as_u64()
    }

    pub fn get_immediate_s32(&self) -> i32 {
        self.value.get_imm_as_s64() as i32
    }
}

/// Arguments of one instruction.
pub type ArgumentInfo = [Argument; MAX_ARGS];

// ---------------------------------------------------------------------------
// RegAlloc
// ---------------------------------------------------------------------------

/// Maps IR values onto host registers for the duration of one block.
pub struct RegAlloc<'a> {
    pub asm: &'a mut CodeAssembler,
    gpr_order: &'static [HostLoc],
    xmm_order: &'static [HostLoc],
    hostloc_info: Vec<HostLocInfo>,
    inst_info: Vec<InstEntry>,
}

impl<'a> RegAlloc<'a> {
    pub fn new(asm: &'a mut CodeAssembler, block: &Block) -> Self {
        let inst_info = block
            .instructions()
            .iter()
            .map(|inst| InstEntry {
                remaining_uses: inst.use_count,
                this_scope_uses: 0,
                bit_width: inst.return_type().bit_width(),
            })
            .collect();
        Self {
            asm,
            gpr_order: ANY_GPR,
            xmm_order: ANY_XMM,
            hostloc_info: (0..TOTAL_HOSTLOC_COUNT).map(|_| HostLocInfo::default()).collect(),
            inst_info,
        }
    }

    // -- Argument info ------------------------------------------------------

    /// Extract the arguments of `inst` for allocation.
    pub fn get_argument_info(&mut self, inst: &Inst) -> ArgumentInfo {
        let mut ret: ArgumentInfo = std::array::from_fn(|_| Argument::new());
        for i in 0..inst.num_args() {
            ret[i].value = inst.args[i];
            if let Value::Inst(r) = inst.args[i] {
                assert!(
                    self.value_location(r).is_some(),
                    "Use of undefined value {}",
                    r
                );
            }
        }
        ret
    }

    pub fn is_value_live(&self, inst_ref: InstRef) -> bool {
        self.value_location(inst_ref).is_some()
    }

    /// Forget one remaining use of `inst_ref`. Called when a pseudo-op that
    /// referenced it is erased, before `inst_ref` itself is defined.
    pub fn decrement_remaining_uses(&mut self, inst_ref: InstRef) {
        let entry = &mut self.inst_info[inst_ref.index()];
        assert!(entry.remaining_uses > 0, "Use count of {} underflowed", inst_ref);
        entry.remaining_uses -= 1;
    }

    /// Consume an argument without generating any code (e.g. the carry-in of
    /// a shift whose carry output is unused).
    pub fn discard_use(&mut self, arg: &mut Argument) {
        assert!(!arg.allocated, "Argument already allocated");
        arg.allocated = true;
        if let Value::Inst(r) = arg.value {
            self.record_use(r);
        }
    }

    fn record_use(&mut self, r: InstRef) {
        let entry = &mut self.inst_info[r.index()];
        entry.this_scope_uses += 1;
        assert!(
            entry.this_scope_uses <= entry.remaining_uses,
            "{} consumed more often than its use count allows",
            r
        );
    }

    /// True when the pending consumption of `r` is its final one, so its
    /// register may be destroyed in place.
    fn is_last_use(&self, r: InstRef) -> bool {
        let entry = &self.inst_info[r.index()];
        entry.remaining_uses - entry.this_scope_uses == 1
    }

    // -- Use ----------------------------------------------------------------

    /// Pin a value in a GPR, read-only. The returned register must not be
    /// written.
    pub fn use_gpr(&mut self, arg: &mut Argument) -> Reg {
        assert!(!arg.allocated, "Argument already allocated");
        arg.allocated = true;
        self.use_impl(arg.value, self.gpr_order).to_reg64()
    }

    /// Pin a value in an XMM register, read-only.
    pub fn use_xmm(&mut self, arg: &mut Argument) -> Reg {
        assert!(!arg.allocated, "Argument already allocated");
        arg.allocated = true;
        self.use_impl(arg.value, self.xmm_order).to_xmm()
    }

    /// Pin a value in one specific location, read-only.
    pub fn use_at(&mut self, arg: &mut Argument, loc: HostLoc) -> Reg {
        assert!(!arg.allocated, "Argument already allocated");
        arg.allocated = true;
        let loc = self.use_impl(arg.value, &[loc]);
        if loc.is_gpr() { loc.to_reg64() } else { loc.to_xmm() }
    }

    // -- UseScratch ---------------------------------------------------------

    /// Deliver a value into a writable register. If the value has further
    /// uses, a canonical copy is preserved elsewhere first.
    pub fn use_scratch_gpr(&mut self, arg: &mut Argument) -> Reg {
        assert!(!arg.allocated, "Argument already allocated");
        arg.allocated = true;
        self.use_scratch_impl(arg.value, self.gpr_order).to_reg64()
    }

    pub fn use_scratch_xmm(&mut self, arg: &mut Argument) -> Reg {
        assert!(!arg.allocated, "Argument already allocated");
        arg.allocated = true;
        self.use_scratch_impl(arg.value, self.xmm_order).to_xmm()
    }

    pub fn use_scratch_at(&mut self, arg: &mut Argument, loc: HostLoc) -> Reg {
        assert!(!arg.allocated, "Argument already allocated");
        arg.allocated = true;
        let loc = self.use_scratch_impl(arg.value, &[loc]);
        if loc.is_gpr() { loc.to_reg64() } else { loc.to_xmm() }
    }

    // -- Scratch ------------------------------------------------------------

    /// A fresh write-locked GPR holding no value.
    pub fn scratch_gpr(&mut self) -> Reg {
        self.scratch_impl(self.gpr_order).to_reg64()
    }

    pub fn scratch_gpr_at(&mut self, desired: HostLoc) -> Reg {
        self.scratch_impl(&[desired]).to_reg64()
    }

    pub fn scratch_xmm(&mut self) -> Reg {
        self.scratch_impl(self.xmm_order).to_xmm()
    }

    // -- Def ----------------------------------------------------------------

    /// Allocate a register for the result of `inst_ref`.
    pub fn def_gpr(&mut self, inst_ref: InstRef) -> Reg {
        let loc = self.scratch_impl(self.gpr_order);
        self.define_value_impl(inst_ref, loc);
        loc.to_reg64()
    }

    pub fn def_gpr_at(&mut self, inst_ref: InstRef, desired: HostLoc) -> Reg {
        let loc = self.scratch_impl(&[desired]);
        self.define_value_impl(inst_ref, loc);
        loc.to_reg64()
    }

    pub fn def_xmm(&mut self, inst_ref: InstRef) -> Reg {
        let loc = self.scratch_impl(self.xmm_order);
        self.define_value_impl(inst_ref, loc);
        loc.to_xmm()
    }

    /// Destructive two-operand form: deliver `arg` into a writable register
    /// and declare `inst_ref`'s result to live there.
    pub fn use_def_gpr(&mut self, arg: &mut Argument, inst_ref: InstRef) -> Reg {
        assert!(!arg.allocated, "Argument already allocated");
        arg.allocated = true;
        let loc = self.use_scratch_impl(arg.value, self.gpr_order);
        self.define_value_impl(inst_ref, loc);
        loc.to_reg64()
    }

    pub fn use_def_xmm(&mut self, arg: &mut Argument, inst_ref: InstRef) -> Reg {
        assert!(!arg.allocated, "Argument already allocated");
        arg.allocated = true;
        let loc = self.use_scratch_impl(arg.value, self.xmm_order);
        self.define_value_impl(inst_ref, loc);
        loc.to_xmm()
    }

    /// Bind `inst_ref`'s result to a register the lowering already holds.
    pub fn define_value(&mut self, inst_ref: InstRef, reg: Reg) {
        self.define_value_impl(inst_ref, reg_to_hostloc(reg));
    }

    /// Zero-instruction aliasing: `inst_ref`'s result is byte-identical to
    /// `arg`, so consumers read `arg`'s location directly. Immediates are
    /// materialised into a fresh register.
    pub fn register_add_def(&mut self, inst_ref: InstRef, arg: &mut Argument) {
        assert!(!arg.allocated, "Argument already allocated");
        arg.allocated = true;
        if arg.value.is_immediate() {
            let loc = self.scratch_impl(self.gpr_order);
            self.load_immediate(arg.value, loc);
            self.define_value_impl(inst_ref, loc);
        } else {
            let use_ref = arg.value.inst_ref();
            let loc = self
                .value_location(use_ref)
                .unwrap_or_else(|| panic!("Use of undefined value {}", use_ref));
            self.record_use(use_ref);
            self.define_value_impl(inst_ref, loc);
        }
    }

    // -- Host calls ---------------------------------------------------------

    /// Prepare for a call into host code: deliver up to four arguments into
    /// the ABI parameter registers, scratch every other caller-saved
    /// register (spilling live contents), and optionally bind `result_def`
    /// to the ABI return register.
    pub fn host_call(&mut self, result_def: Option<InstRef>, mut args: [Option<&mut Argument>; 4]) {
        let args_hostloc = [
            abi::ABI_PARAMS[0],
            abi::ABI_PARAMS[1],
            abi::ABI_PARAMS[2],
            abi::ABI_PARAMS[3],
        ];

        self.scratch_impl(&[abi::ABI_RETURN]);
        if let Some(inst_ref) = result_def {
            self.define_value_impl(inst_ref, abi::ABI_RETURN);
        }

        for (i, arg_opt) in args.iter_mut().enumerate() {
            if let Some(arg) = arg_opt {
                assert!(!arg.is_void());
                assert!(!arg.allocated, "Argument already allocated");
                arg.allocated = true;
                self.use_scratch_impl(arg.value, &[args_hostloc[i]]);

                // Zero-extend sub-word arguments per the ABI.
                let reg = args_hostloc[i].to_reg64();
                match arg.get_type() {
                    Type::U1 | Type::U8 => {
                        self.asm.movzx(reg.cvt32(), reg.cvt8());
                    }
                    Type::U16 => {
                        self.asm.movzx(reg.cvt32(), reg.cvt16());
                    }
                    Type::U32 => {
                        self.asm.mov(reg.cvt32(), reg.cvt32());
                    }
                    _ => {}
                }
            }
        }

        for (i, arg_opt) in args.iter().enumerate() {
            if arg_opt.is_none() {
                self.scratch_impl(&[args_hostloc[i]]);
            }
        }

        for &loc in abi::CALLER_SAVE_GPRS {
            if loc == abi::ABI_RETURN || args_hostloc.contains(&loc) {
                continue;
            }
            if !self.loc_info(loc).is_locked() {
                self.scratch_impl(&[loc]);
            }
        }
        for &loc in abi::CALLER_SAVE_XMMS {
            if !self.loc_info(loc).is_locked() {
                self.scratch_impl(&[loc]);
            }
        }
    }

    // -- Scope management ---------------------------------------------------

    /// Fold this instruction's consumptions into the use counts, reclaim
    /// dead values, and release every lock.
    pub fn end_of_alloc_scope(&mut self) {
        for entry in &mut self.inst_info {
            entry.remaining_uses -= entry.this_scope_uses;
            entry.this_scope_uses = 0;
        }
        for info in &mut self.hostloc_info {
            info.lock_count = 0;
            info.is_scratch = false;
            let inst_info = &self.inst_info;
            info.values.retain(|v| inst_info[v.index()].remaining_uses > 0);
            if info.values.is_empty() {
                info.max_bit_width = 0;
            }
        }
    }

    /// Verify every value has been fully consumed. Catches miscounted
    /// consumers at the end of a block.
    pub fn assert_no_more_uses(&self) {
        for (i, info) in self.hostloc_info.iter().enumerate() {
            assert!(
                info.is_empty(),
                "{:?} still holds {:?} at end of block",
                index_to_hostloc(i),
                info.values
            );
        }
    }

    // -- Internals ----------------------------------------------------------

    pub fn value_location(&self, inst_ref: InstRef) -> Option<HostLoc> {
        for (i, info) in self.hostloc_info.iter().enumerate() {
            if info.values.contains(&inst_ref) {
                return Some(index_to_hostloc(i));
            }
        }
        None
    }

    fn loc_info(&self, loc: HostLoc) -> &HostLocInfo {
        &self.hostloc_info[hostloc_to_index(loc)]
    }

    fn loc_info_mut(&mut self, loc: HostLoc) -> &mut HostLocInfo {
        &mut self.hostloc_info[hostloc_to_index(loc)]
    }

    fn use_impl(&mut self, use_value: Value, desired: &[HostLoc]) -> HostLoc {
        if use_value.is_immediate() {
            let scratch = self.scratch_impl(desired);
            return self.load_immediate(use_value, scratch);
        }

        let use_ref = use_value.inst_ref();
        let current = self
            .value_location(use_ref)
            .unwrap_or_else(|| panic!("Use of undefined value {}", use_ref));

        if desired.contains(&current) && !self.loc_info(current).is_scratch {
            self.record_use(use_ref);
            self.loc_info_mut(current).read_lock();
            return current;
        }

        if self.loc_info(current).is_locked() {
            // A locked location cannot be moved; read from a copy.
            return self.use_scratch_impl(use_value, desired);
        }

        let dest = self.select_a_register(desired);
        if self.loc_info(current).max_bit_width > dest.bit_width() {
            return self.use_scratch_impl(use_value, desired);
        }

        if dest.is_gpr() && current.is_gpr() {
            self.exchange(dest, current);
        } else {
            self.move_out_of_the_way(dest);
            self.move_value(dest, current);
        }
        self.record_use(use_ref);
        self.loc_info_mut(dest).read_lock();
        dest
    }

    fn use_scratch_impl(&mut self, use_value: Value, desired: &[HostLoc]) -> HostLoc {
        if use_value.is_immediate() {
            let scratch = self.scratch_impl(desired);
            return self.load_immediate(use_value, scratch);
        }

        let use_ref = use_value.inst_ref();
        let current = self
            .value_location(use_ref)
            .unwrap_or_else(|| panic!("Use of undefined value {}", use_ref));
        let bit_width = self.inst_info[use_ref.index()].bit_width;

        let reusable_in_place = desired.contains(&current)
            && !self.loc_info(current).is_locked()
            && self.loc_info(current).values.len() == 1
            && self.is_last_use(use_ref);

        if reusable_in_place {
            self.record_use(use_ref);
            let info = self.loc_info_mut(current);
            info.values.clear();
            info.max_bit_width = 0;
            info.write_lock();
            return current;
        }

        if desired.contains(&current) && !self.loc_info(current).is_locked() {
            // Destructive use of a value that must survive: bank the
            // canonical copy elsewhere; the register still holds the bytes.
            self.move_out_of_the_way(current);
            self.record_use(use_ref);
            self.loc_info_mut(current).write_lock();
            return current;
        }

        let dest = self.select_a_register(desired);
        self.move_out_of_the_way(dest);
        assert!(!self.loc_info(current).is_empty(), "Source vanished during allocation");
        self.emit_move(bit_width, dest, current);
        self.record_use(use_ref);
        self.loc_info_mut(dest).write_lock();
        dest
    }

    fn scratch_impl(&mut self, desired: &[HostLoc]) -> HostLoc {
        let location = self.select_a_register(desired);
        self.move_out_of_the_way(location);
        self.loc_info_mut(location).write_lock();
        location
    }

    fn define_value_impl(&mut self, inst_ref: InstRef, host_loc: HostLoc) {
        assert!(
            self.value_location(inst_ref).is_none(),
            "{} has already been defined",
            inst_ref
        );
        let bit_width = self.inst_info[inst_ref.index()].bit_width;
        self.loc_info_mut(host_loc).add_value(inst_ref, bit_width);
    }

    /// Choose a register: empty and unlocked first, then the occupied
    /// unlocked register whose contents have the most uses left (the
    /// longest expected live range gets evicted).
    fn select_a_register(&self, desired: &[HostLoc]) -> HostLoc {
        for &loc in desired {
            if !self.loc_info(loc).is_locked() && self.loc_info(loc).is_empty() {
                return loc;
            }
        }
        desired
            .iter()
            .copied()
            .filter(|&loc| !self.loc_info(loc).is_locked())
            .max_by_key(|&loc| self.location_remaining_uses(loc))
            .expect("All candidate registers are locked")
    }

    fn location_remaining_uses(&self, loc: HostLoc) -> u32 {
        self.loc_info(loc)
            .values
            .iter()
            .map(|v| self.inst_info[v.index()].remaining_uses)
            .sum()
    }

    fn load_immediate(&mut self, imm: Value, host_loc: HostLoc) -> HostLoc {
        assert!(imm.is_immediate());
        if host_loc.is_gpr() {
            let reg = host_loc.to_reg64();
            let value = imm.get_imm_as_u64();
            if value == 0 {
                self.asm.xor_(reg.cvt32(), reg.cvt32());
            } else {
                self.asm.mov(reg, value as i64);
            }
            host_loc
        } else if host_loc.is_xmm() {
            let reg = host_loc.to_xmm();
            assert!(imm.is_zero(), "Non-zero FP immediates are materialised via GPR transfers");
            self.asm.xorps(reg, reg);
            host_loc
        } else {
            panic!("Cannot load an immediate into a spill slot");
        }
    }

    fn move_value(&mut self, to: HostLoc, from: HostLoc) {
        assert!(self.loc_info(to).is_empty(), "Destination must be empty");
        assert!(!self.loc_info(from).is_locked(), "Source must not be locked");

        if self.loc_info(from).is_empty() {
            return;
        }
        let bit_width = self.loc_info(from).max_bit_width;
        assert!(bit_width <= to.bit_width(), "Value too wide for destination");

        self.emit_move(bit_width, to, from);

        let from_info = std::mem::take(&mut self.hostloc_info[hostloc_to_index(from)]);
        self.hostloc_info[hostloc_to_index(to)] = from_info;
    }

    fn exchange(&mut self, a: HostLoc, b: HostLoc) {
        assert!(!self.loc_info(a).is_locked() && !self.loc_info(b).is_locked());

        if self.loc_info(a).is_empty() {
            self.move_value(a, b);
            return;
        }
        if self.loc_info(b).is_empty() {
            self.move_value(b, a);
            return;
        }

        self.asm.xchg(a.to_reg64(), b.to_reg64());
        self.hostloc_info.swap(hostloc_to_index(a), hostloc_to_index(b));
    }

    fn move_out_of_the_way(&mut self, loc: HostLoc) {
        assert!(!self.loc_info(loc).is_locked(), "Cannot evict a locked register");
        if !self.loc_info(loc).is_empty() {
            let spill = self.find_free_spill();
            self.move_value(spill, loc);
        }
    }

    fn find_free_spill(&self) -> HostLoc {
        for i in 0..SPILL_COUNT {
            let loc = HostLoc::Spill(i as u8);
            if self.loc_info(loc).is_empty() {
                return loc;
            }
        }
        panic!("All spill slots are full");
    }

    fn spill_address(&self, loc: HostLoc, bit_width: usize) -> crate::backend::x64::assembler::Address {
        let offset = JitState::spill_offset(loc.spill_index() as usize) as i32;
        if bit_width == 64 {
            qword_ptr(RegExp::from(R15) + offset)
        } else {
            dword_ptr(RegExp::from(R15) + offset)
        }
    }

    fn emit_move(&mut self, bit_width: usize, to: HostLoc, from: HostLoc) {
        match (to, from) {
            (HostLoc::Gpr(_), HostLoc::Gpr(_)) => {
                if bit_width == 64 {
                    self.asm.mov(to.to_reg64(), from.to_reg64());
                } else {
                    self.asm.mov(to.to_reg64().cvt32(), from.to_reg64().cvt32());
                }
            }
            (HostLoc::Xmm(_), HostLoc::Xmm(_)) => {
                self.asm.movaps(to.to_xmm(), from.to_xmm());
            }
            (HostLoc::Xmm(_), HostLoc::Gpr(_)) => {
                if bit_width == 64 {
                    self.asm.movq(to.to_xmm(), from.to_reg64());
                } else {
                    self.asm.movd(to.to_xmm(), from.to_reg64().cvt32());
                }
            }
            (HostLoc::Gpr(_), HostLoc::Xmm(_)) => {
                if bit_width == 64 {
                    self.asm.movq(to.to_reg64(), from.to_xmm());
                } else {
                    self.asm.movd(to.to_reg64().cvt32(), from.to_xmm());
                }
            }
            (HostLoc::Xmm(_), HostLoc::Spill(_)) => {
                let addr = self.spill_address(from, bit_width);
                if bit_width == 64 {
                    self.asm.movsd(to.to_xmm(), addr);
                } else {
                    self.asm.movss(to.to_xmm(), addr);
                }
            }
            (HostLoc::Spill(_), HostLoc::Xmm(_)) => {
                let addr = self.spill_address(to, bit_width);
                if bit_width == 64 {
                    self.asm.movsd(addr, from.to_xmm());
                } else {
                    self.asm.movss(addr, from.to_xmm());
                }
            }
            (HostLoc::Gpr(_), HostLoc::Spill(_)) => {
                let addr = self.spill_address(from, bit_width);
                if bit_width == 64 {
                    self.asm.mov(to.to_reg64(), addr);
                } else {
                    self.asm.mov(to.to_reg64().cvt32(), addr);
                }
            }
            (HostLoc::Spill(_), HostLoc::Gpr(_)) => {
                let addr = self.spill_address(to, bit_width);
                if bit_width == 64 {
                    self.asm.mov(addr, from.to_reg64());
                } else {
                    self.asm.mov(addr, from.to_reg64().cvt32());
                }
            }
            _ => panic!("Invalid move {:?} -> {:?}", from, to),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::Reg as ArmReg;
    use crate::ir::location::LocationDescriptor;
    use crate::ir::opcode::Opcode;

    fn asm() -> CodeAssembler {
        CodeAssembler::new(64 * 1024).unwrap()
    }

    /// A block shaped like `r = GetRegister(R1); SetRegister(R0, r)`.
    fn simple_block() -> Block {
        let mut block = Block::new(LocationDescriptor::at(0));
        let a = block.append(Opcode::GetRegister, &[Value::ImmRegRef(ArmReg::R1)]);
        block.append(Opcode::SetRegister, &[Value::ImmRegRef(ArmReg::R0), Value::Inst(a)]);
        block
    }

    #[test]
    fn test_define_use_and_death() {
        let mut a = asm();
        let block = simple_block();
        let mut ra = RegAlloc::new(&mut a, &block);

        let result = ra.def_gpr(InstRef(0));
        let loc = reg_to_hostloc(result);
        ra.end_of_alloc_scope();
        assert!(ra.is_value_live(InstRef(0)));
        assert_eq!(ra.value_location(InstRef(0)), Some(loc));

        let consumer = block.get(InstRef(1)).clone();
        let mut args = ra.get_argument_info(&consumer);
        let _used = ra.use_gpr(&mut args[1]);
        ra.end_of_alloc_scope();

        assert!(!ra.is_value_live(InstRef(0)));
        ra.assert_no_more_uses();
    }

    #[test]
    fn test_use_def_reuses_register_on_last_use() {
        let mut a = asm();
        let mut block = Block::new(LocationDescriptor::at(0));
        let g = block.append(Opcode::GetRegister, &[Value::ImmRegRef(ArmReg::R1)]);
        let n = block.append(Opcode::Not, &[Value::Inst(g)]);
        block.append(Opcode::SetRegister, &[Value::ImmRegRef(ArmReg::R0), Value::Inst(n)]);

        let mut ra = RegAlloc::new(&mut a, &block);
        let src_reg = ra.def_gpr(g);
        ra.end_of_alloc_scope();
        let emitted_before = ra.asm.size();

        let not_inst = block.get(n).clone();
        let mut args = ra.get_argument_info(&not_inst);
        let dst_reg = ra.use_def_gpr(&mut args[0], n);
        assert_eq!(dst_reg.get_idx(), src_reg.get_idx());
        assert_eq!(ra.asm.size(), emitted_before, "In-place reuse must not emit code");
        ra.end_of_alloc_scope();
        assert!(!ra.is_value_live(g));
        assert!(ra.is_value_live(n));
    }

    #[test]
    fn test_use_def_preserves_value_with_more_uses() {
        let mut a = asm();
        let mut block = Block::new(LocationDescriptor::at(0));
        let g = block.append(Opcode::GetRegister, &[Value::ImmRegRef(ArmReg::R1)]);
        let n = block.append(Opcode::Not, &[Value::Inst(g)]);
        // g is used twice: by n and by the final store.
        block.append(Opcode::SetRegister, &[Value::ImmRegRef(ArmReg::R0), Value::Inst(g)]);
        block.append(Opcode::SetRegister, &[Value::ImmRegRef(ArmReg::R1), Value::Inst(n)]);

        let mut ra = RegAlloc::new(&mut a, &block);
        ra.def_gpr(g);
        ra.end_of_alloc_scope();

        let not_inst = block.get(n).clone();
        let mut args = ra.get_argument_info(&not_inst);
        let _dst = ra.use_def_gpr(&mut args[0], n);
        ra.end_of_alloc_scope();

        // g survives (banked in a spill slot), distinct from n's location.
        assert!(ra.is_value_live(g));
        assert!(ra.is_value_live(n));
        assert_ne!(ra.value_location(g), ra.value_location(n));
    }

    #[test]
    fn test_same_value_used_twice_in_one_instruction() {
        let mut a = asm();
        let mut block = Block::new(LocationDescriptor::at(0));
        let g = block.append(Opcode::GetRegister, &[Value::ImmRegRef(ArmReg::R1)]);
        let add = block.append(
            Opcode::AddWithCarry,
            &[Value::Inst(g), Value::Inst(g), Value::ImmU1(false)],
        );
        block.append(Opcode::SetRegister, &[Value::ImmRegRef(ArmReg::R0), Value::Inst(add)]);

        let mut ra = RegAlloc::new(&mut a, &block);
        ra.def_gpr(g);
        ra.end_of_alloc_scope();

        let add_inst = block.get(add).clone();
        let mut args = ra.get_argument_info(&add_inst);
        // Destructive first use must not clobber the second one's source.
        let dst = ra.use_def_gpr(&mut args[0], add);
        let src = ra.use_gpr(&mut args[1]);
        assert_ne!(dst.get_idx(), src.get_idx());
        ra.end_of_alloc_scope();
        assert!(!ra.is_value_live(g));
        assert!(ra.is_value_live(add));
    }

    #[test]
    fn test_register_add_def_aliases() {
        let mut a = asm();
        let mut block = Block::new(LocationDescriptor::at(0));
        let g = block.append(Opcode::ZeroExtendWordToLong, &[Value::ImmU32(5)]);
        let id = block.append(Opcode::Identity, &[Value::Inst(g)]);
        block.append(Opcode::SetRegister, &[Value::ImmRegRef(ArmReg::R0), Value::Inst(id)]);

        let mut ra = RegAlloc::new(&mut a, &block);
        let reg = ra.def_gpr(g);
        ra.end_of_alloc_scope();

        let id_inst = block.get(id).clone();
        let mut args = ra.get_argument_info(&id_inst);
        ra.register_add_def(id, &mut args[0]);
        ra.end_of_alloc_scope();

        assert_eq!(ra.value_location(id), Some(reg_to_hostloc(reg)));
        assert!(!ra.is_value_live(g), "Aliased source had no other uses");
    }

    #[test]
    fn test_spill_and_reload() {
        let mut a = asm();
        let mut block = Block::new(LocationDescriptor::at(0));
        let n = ANY_GPR.len() + 1;
        let mut refs = Vec::new();
        for _ in 0..n {
            refs.push(block.append(Opcode::GetRegister, &[Value::ImmRegRef(ArmReg::R1)]));
        }
        for &r in &refs {
            block.append(Opcode::SetRegister, &[Value::ImmRegRef(ArmReg::R0), Value::Inst(r)]);
        }

        let mut ra = RegAlloc::new(&mut a, &block);
        for &r in &refs {
            ra.def_gpr(r);
            ra.end_of_alloc_scope();
        }

        for &r in &refs {
            assert!(ra.is_value_live(r), "{} should still be live", r);
        }
        let spilled = refs
            .iter()
            .filter(|&&r| matches!(ra.value_location(r), Some(HostLoc::Spill(_))))
            .count();
        assert!(spilled > 0, "Filling every GPR must spill at least one value");

        // Reload the first (spilled or not) value and verify it is consumed.
        let store = block.get(InstRef(n as u32)).clone();
        let mut args = ra.get_argument_info(&store);
        let reg = ra.use_gpr(&mut args[1]);
        assert!(reg.is_gpr());
        ra.end_of_alloc_scope();
        assert!(!ra.is_value_live(refs[0]));
    }

    #[test]
    fn test_discard_use_kills_value() {
        let mut a = asm();
        let mut block = Block::new(LocationDescriptor::at(0));
        let carry = block.append(Opcode::GetCFlag, &[]);
        let shift = block.append(
            Opcode::LogicalShiftLeft,
            &[Value::ImmU32(1), Value::ImmU8(2), Value::Inst(carry)],
        );
        block.append(Opcode::SetRegister, &[Value::ImmRegRef(ArmReg::R0), Value::Inst(shift)]);

        let mut ra = RegAlloc::new(&mut a, &block);
        ra.def_gpr(carry);
        ra.end_of_alloc_scope();

        let shift_inst = block.get(shift).clone();
        let mut args = ra.get_argument_info(&shift_inst);
        ra.discard_use(&mut args[2]);
        let _r = ra.use_def_gpr(&mut args[0], shift);
        ra.end_of_alloc_scope();

        assert!(!ra.is_value_live(carry), "Discarded value must die");
    }

    #[test]
    fn test_host_call_binds_return_register() {
        let mut a = asm();
        let mut block = Block::new(LocationDescriptor::at(0));
        let addr = block.append(Opcode::GetRegister, &[Value::ImmRegRef(ArmReg::R1)]);
        let load = block.append(Opcode::ReadMemory32, &[Value::Inst(addr)]);
        block.append(Opcode::SetRegister, &[Value::ImmRegRef(ArmReg::R0), Value::Inst(load)]);

        let mut ra = RegAlloc::new(&mut a, &block);
        ra.def_gpr(addr);
        ra.end_of_alloc_scope();

        let load_inst = block.get(load).clone();
        let mut args = ra.get_argument_info(&load_inst);
        let [a0, ..] = &mut args;
        ra.host_call(Some(load), [Some(a0), None, None, None]);
        ra.end_of_alloc_scope();

        assert_eq!(ra.value_location(load), Some(abi::ABI_RETURN));
        assert!(!ra.is_value_live(addr));
    }

    #[test]
    fn test_eviction_prefers_most_remaining_uses() {
        let mut a = asm();
        let mut block = Block::new(LocationDescriptor::at(0));
        // v0 has three uses, v1 has one: filling the remaining registers and
        // asking for one more should evict v0 (longest expected range).
        let v0 = block.append(Opcode::GetRegister, &[Value::ImmRegRef(ArmReg::R1)]);
        let v1 = block.append(Opcode::GetRegister, &[Value::ImmRegRef(ArmReg::R2)]);
        for _ in 0..3 {
            block.append(Opcode::SetRegister, &[Value::ImmRegRef(ArmReg::R0), Value::Inst(v0)]);
        }
        block.append(Opcode::SetRegister, &[Value::ImmRegRef(ArmReg::R0), Value::Inst(v1)]);
        let mut fillers = Vec::new();
        for _ in 0..ANY_GPR.len() - 2 {
            let f = block.append(Opcode::GetRegister, &[Value::ImmRegRef(ArmReg::R3)]);
            block.append(Opcode::SetRegister, &[Value::ImmRegRef(ArmReg::R0), Value::Inst(f)]);
            fillers.push(f);
        }
        let extra = block.append(Opcode::GetRegister, &[Value::ImmRegRef(ArmReg::R4)]);
        block.append(Opcode::SetRegister, &[Value::ImmRegRef(ArmReg::R0), Value::Inst(extra)]);

        let mut ra = RegAlloc::new(&mut a, &block);
        ra.def_gpr(v0);
        ra.end_of_alloc_scope();
        ra.def_gpr(v1);
        ra.end_of_alloc_scope();
        for &f in &fillers {
            ra.def_gpr(f);
            ra.end_of_alloc_scope();
        }
        ra.def_gpr(extra);
        ra.end_of_alloc_scope();

        assert!(matches!(ra.value_location(v0), Some(HostLoc::Spill(_))));
        assert!(matches!(ra.value_location(v1), Some(HostLoc::Gpr(_))));
    }

    #[test]
    fn test_assert_no_more_uses_panics_on_leak() {
        let mut a = asm();
        let block = simple_block();
        let mut ra = RegAlloc::new(&mut a, &block);
        ra.def_gpr(InstRef(0));
        ra.end_of_alloc_scope();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            ra.assert_no_more_uses();
        }));
        assert!(result.is_err());
    }
}
