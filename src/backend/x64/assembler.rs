//! x86-64 code assembler.
//!
//! Append-only emitter producing executable bytes into an `mmap`ed arena.
//! Emit methods are named after the instructions they encode and take typed
//! register/memory/immediate operands. Operand misuse and buffer exhaustion
//! are programmer errors and panic; only arena allocation itself is fallible.

use std::fmt;
use std::ops::{Add, Mul};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AsmError {
    #[error("failed to allocate {0} bytes of executable memory")]
    AllocFailed(usize),
    #[error("failed to change code buffer protection")]
    ProtectFailed,
}

pub type Result<T> = std::result::Result<T, AsmError>;

// ---------------------------------------------------------------------------
// Registers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RegKind {
    Gpr,
    Xmm,
}

/// A host register operand: a GPR of width 8/16/32/64 or an XMM register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg {
    idx: u8,
    bits: u16,
    kind: RegKind,
}

impl Reg {
    pub const fn gpr8(idx: u8) -> Reg {
        Reg { idx, bits: 8, kind: RegKind::Gpr }
    }

    pub const fn gpr16(idx: u8) -> Reg {
        Reg { idx, bits: 16, kind: RegKind::Gpr }
    }

    pub const fn gpr32(idx: u8) -> Reg {
        Reg { idx, bits: 32, kind: RegKind::Gpr }
    }

    pub const fn gpr64(idx: u8) -> Reg {
        Reg { idx, bits: 64, kind: RegKind::Gpr }
    }

    pub const fn xmm(idx: u8) -> Reg {
        Reg { idx, bits: 128, kind: RegKind::Xmm }
    }

    pub fn get_idx(self) -> u8 {
        self.idx
    }

    pub fn get_bit(self) -> u16 {
        self.bits
    }

    pub fn is_xmm(self) -> bool {
        self.kind == RegKind::Xmm
    }

    pub fn is_gpr(self) -> bool {
        self.kind == RegKind::Gpr
    }

    pub fn cvt8(self) -> Reg {
        assert!(self.is_gpr());
        Reg::gpr8(self.idx)
    }

    pub fn cvt16(self) -> Reg {
        assert!(self.is_gpr());
        Reg::gpr16(self.idx)
    }

    pub fn cvt32(self) -> Reg {
        assert!(self.is_gpr());
        Reg::gpr32(self.idx)
    }

    pub fn cvt64(self) -> Reg {
        assert!(self.is_gpr());
        Reg::gpr64(self.idx)
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_xmm() {
            write!(f, "xmm{}", self.idx)
        } else {
            write!(f, "r{}b{}", self.idx, self.bits)
        }
    }
}

pub const RAX: Reg = Reg::gpr64(0);
pub const RCX: Reg = Reg::gpr64(1);
pub const RDX: Reg = Reg::gpr64(2);
pub const RBX: Reg = Reg::gpr64(3);
pub const RSP: Reg = Reg::gpr64(4);
pub const RBP: Reg = Reg::gpr64(5);
pub const RSI: Reg = Reg::gpr64(6);
pub const RDI: Reg = Reg::gpr64(7);
pub const R8: Reg = Reg::gpr64(8);
pub const R9: Reg = Reg::gpr64(9);
pub const R10: Reg = Reg::gpr64(10);
pub const R11: Reg = Reg::gpr64(11);
pub const R12: Reg = Reg::gpr64(12);
pub const R13: Reg = Reg::gpr64(13);
pub const R14: Reg = Reg::gpr64(14);
pub const R15: Reg = Reg::gpr64(15);

pub const EAX: Reg = Reg::gpr32(0);
pub const ECX: Reg = Reg::gpr32(1);
pub const EBX: Reg = Reg::gpr32(3);
pub const ESI: Reg = Reg::gpr32(6);

pub const AL: Reg = Reg::gpr8(0);
pub const CL: Reg = Reg::gpr8(1);

pub const XMM0: Reg = Reg::xmm(0);
pub const XMM1: Reg = Reg::xmm(1);
pub const XMM2: Reg = Reg::xmm(2);
pub const XMM3: Reg = Reg::xmm(3);
pub const XMM4: Reg = Reg::xmm(4);
pub const XMM5: Reg = Reg::xmm(5);
pub const XMM6: Reg = Reg::xmm(6);
pub const XMM7: Reg = Reg::xmm(7);
pub const XMM8: Reg = Reg::xmm(8);
pub const XMM9: Reg = Reg::xmm(9);
pub const XMM10: Reg = Reg::xmm(10);
pub const XMM11: Reg = Reg::xmm(11);
pub const XMM12: Reg = Reg::xmm(12);
pub const XMM13: Reg = Reg::xmm(13);
pub const XMM14: Reg = Reg::xmm(14);
pub const XMM15: Reg = Reg::xmm(15);

// ---------------------------------------------------------------------------
// Memory operands
// ---------------------------------------------------------------------------

/// An address expression: `base + index * scale + disp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegExp {
    base: Option<Reg>,
    index: Option<Reg>,
    scale: u8,
    disp: i32,
}

impl From<Reg> for RegExp {
    fn from(base: Reg) -> Self {
        assert!(base.is_gpr() && base.get_bit() == 64);
        RegExp { base: Some(base), index: None, scale: 1, disp: 0 }
    }
}

impl Add<i32> for RegExp {
    type Output = RegExp;
    fn add(mut self, rhs: i32) -> RegExp {
        self.disp = self.disp.wrapping_add(rhs);
        self
    }
}

impl Add<RegExp> for RegExp {
    type Output = RegExp;
    fn add(mut self, rhs: RegExp) -> RegExp {
        if let Some(b) = rhs.base {
            if self.base.is_none() {
                self.base = Some(b);
            } else {
                assert!(self.index.is_none(), "Address expression has too many registers");
                self.index = Some(b);
                self.scale = 1;
            }
        }
        if let Some(i) = rhs.index {
            assert!(self.index.is_none(), "Address expression has too many index terms");
            self.index = Some(i);
            self.scale = rhs.scale;
        }
        self.disp = self.disp.wrapping_add(rhs.disp);
        self
    }
}

impl Mul<u8> for Reg {
    type Output = RegExp;
    fn mul(self, scale: u8) -> RegExp {
        assert!(matches!(scale, 1 | 2 | 4 | 8), "Invalid address scale {}", scale);
        assert!(self.is_gpr() && self.get_bit() == 64);
        assert!(self.get_idx() != 4, "RSP cannot be an index register");
        RegExp { base: None, index: Some(self), scale, disp: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddrKind {
    Expr(RegExp),
    /// RIP-relative reference to an absolute offset within this code buffer.
    Rip(usize),
}

/// A sized memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    bits: u16,
    kind: AddrKind,
}

impl Address {
    pub fn rip(bits: u16, buffer_offset: usize) -> Address {
        Address { bits, kind: AddrKind::Rip(buffer_offset) }
    }

    pub fn get_bit(self) -> u16 {
        self.bits
    }
}

pub fn byte_ptr(e: impl Into<RegExp>) -> Address {
    Address { bits: 8, kind: AddrKind::Expr(e.into()) }
}

pub fn word_ptr(e: impl Into<RegExp>) -> Address {
    Address { bits: 16, kind: AddrKind::Expr(e.into()) }
}

pub fn dword_ptr(e: impl Into<RegExp>) -> Address {
    Address { bits: 32, kind: AddrKind::Expr(e.into()) }
}

pub fn qword_ptr(e: impl Into<RegExp>) -> Address {
    Address { bits: 64, kind: AddrKind::Expr(e.into()) }
}

pub fn xmmword_ptr(e: impl Into<RegExp>) -> Address {
    Address { bits: 128, kind: AddrKind::Expr(e.into()) }
}

// ---------------------------------------------------------------------------
// Generic operand
// ---------------------------------------------------------------------------

/// Operand accepted by most emit methods: register, memory, or immediate.
#[derive(Debug, Clone, Copy)]
pub enum Op {
    R(Reg),
    M(Address),
    Imm(i64),
}

impl Op {
    fn bits(&self) -> u16 {
        match self {
            Op::R(r) => r.get_bit(),
            Op::M(m) => m.get_bit(),
            Op::Imm(_) => panic!("Immediate operand has no intrinsic width"),
        }
    }
}

impl From<Reg> for Op {
    fn from(r: Reg) -> Op { Op::R(r) }
}
impl From<Address> for Op {
    fn from(m: Address) -> Op { Op::M(m) }
}
impl From<i32> for Op {
    fn from(v: i32) -> Op { Op::Imm(v as i64) }
}
impl From<i64> for Op {
    fn from(v: i64) -> Op { Op::Imm(v) }
}
impl From<u32> for Op {
    fn from(v: u32) -> Op { Op::Imm(v as i64) }
}

// ---------------------------------------------------------------------------
// Condition codes
// ---------------------------------------------------------------------------

/// x86 condition-code nibble, used by jcc/setcc/cmovcc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cc {
    O = 0x0,
    No = 0x1,
    B = 0x2,
    Nb = 0x3,
    Z = 0x4,
    Nz = 0x5,
    Be = 0x6,
    A = 0x7,
    S = 0x8,
    Ns = 0x9,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Intra-buffer label for forward jumps. Fixups resolve at `bind`.
#[derive(Debug, Clone, Copy)]
pub struct Label(usize);

#[derive(Debug, Default)]
struct LabelState {
    pos: Option<usize>,
    /// Buffer offsets of pending rel32 fields.
    fixups: Vec<usize>,
}

// ---------------------------------------------------------------------------
// The assembler
// ---------------------------------------------------------------------------

pub struct CodeAssembler {
    buf: *mut u8,
    capacity: usize,
    size: usize,
    labels: Vec<LabelState>,
}

// The raw pointer is uniquely owned; the buffer is only touched through &mut.
unsafe impl Send for CodeAssembler {}

impl CodeAssembler {
    pub fn new(capacity: usize) -> Result<Self> {
        let buf = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if buf == libc::MAP_FAILED {
            return Err(AsmError::AllocFailed(capacity));
        }
        Ok(Self {
            buf: buf as *mut u8,
            capacity,
            size: 0,
            labels: Vec::new(),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Relocate the write cursor. Used to rewrite patch regions; the caller
    /// must restore the cursor afterwards.
    pub fn set_size(&mut self, size: usize) {
        assert!(size <= self.capacity);
        self.size = size;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn top(&self) -> *const u8 {
        self.buf
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.buf, self.size) }
    }

    pub fn set_protect_mode_re(&mut self) -> Result<()> {
        self.mprotect(libc::PROT_READ | libc::PROT_EXEC)
    }

    pub fn set_protect_mode_rw(&mut self) -> Result<()> {
        self.mprotect(libc::PROT_READ | libc::PROT_WRITE)
    }

    pub fn set_protect_mode_rwe(&mut self) -> Result<()> {
        self.mprotect(libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC)
    }

    fn mprotect(&mut self, prot: i32) -> Result<()> {
        let ret = unsafe { libc::mprotect(self.buf as *mut libc::c_void, self.capacity, prot) };
        if ret != 0 {
            return Err(AsmError::ProtectFailed);
        }
        Ok(())
    }

    // -- Raw byte emission --------------------------------------------------

    pub fn db(&mut self, b: u8) {
        assert!(self.size < self.capacity, "Code buffer exhausted");
        unsafe { *self.buf.add(self.size) = b };
        self.size += 1;
    }

    pub fn dw(&mut self, v: u16) {
        for b in v.to_le_bytes() {
            self.db(b);
        }
    }

    pub fn dd(&mut self, v: u32) {
        for b in v.to_le_bytes() {
            self.db(b);
        }
    }

    pub fn dq(&mut self, v: u64) {
        for b in v.to_le_bytes() {
            self.db(b);
        }
    }

    fn write_u32_at(&mut self, pos: usize, v: u32) {
        assert!(pos + 4 <= self.capacity);
        for (i, b) in v.to_le_bytes().iter().enumerate() {
            unsafe { *self.buf.add(pos + i) = *b };
        }
    }

    /// Pad with NOPs until the cursor is `alignment`-aligned.
    pub fn align(&mut self, alignment: usize) {
        while !self.size.is_multiple_of(alignment) {
            self.nop();
        }
    }

    /// Assert a patch region did not overflow its contract and pad it with
    /// NOPs to exactly `size` bytes.
    pub fn ensure_patch_location_size(&mut self, start: usize, size: usize) {
        assert!(
            self.size >= start && self.size - start <= size,
            "Patch region overran its {} byte contract ({} bytes)",
            size,
            self.size - start
        );
        while self.size - start < size {
            self.nop();
        }
    }

    // -- Labels -------------------------------------------------------------

    pub fn create_label(&mut self) -> Label {
        self.labels.push(LabelState::default());
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: &Label) {
        let pos = self.size;
        let state = &mut self.labels[label.0];
        assert!(state.pos.is_none(), "Label bound twice");
        state.pos = Some(pos);
        let fixups = std::mem::take(&mut state.fixups);
        for fixup in fixups {
            let rel = pos as i64 - (fixup as i64 + 4);
            self.write_u32_at(fixup, rel as i32 as u32);
        }
    }

    /// Emit a rel32 field referring to `label`, possibly as a forward fixup.
    fn emit_label_rel32(&mut self, label: &Label) {
        match self.labels[label.0].pos {
            Some(pos) => {
                let rel = pos as i64 - (self.size as i64 + 4);
                self.dd(rel as i32 as u32);
            }
            None => {
                let fixup = self.size;
                self.labels[label.0].fixups.push(fixup);
                self.dd(0);
            }
        }
    }

    // -- Encoding core ------------------------------------------------------

    /// Emit prefixes, opcode, ModRM and addressing bytes for one instruction.
    ///
    /// `reg` is the full 4-bit register-field value; `imm_len` is the number
    /// of immediate bytes the caller will append (needed to resolve
    /// RIP-relative displacements).
    fn encode(
        &mut self,
        pfx66: bool,
        mandatory: Option<u8>,
        rex_w: bool,
        force_rex: bool,
        opcode: &[u8],
        reg: u8,
        rm: Op,
        imm_len: usize,
    ) {
        if pfx66 {
            self.db(0x66);
        }
        if let Some(p) = mandatory {
            self.db(p);
        }

        let (rex_b, rex_x) = match rm {
            Op::R(r) => (r.get_idx() >> 3, 0),
            Op::M(m) => match m.kind {
                AddrKind::Expr(e) => (
                    e.base.map_or(0, |b| b.get_idx() >> 3),
                    e.index.map_or(0, |i| i.get_idx() >> 3),
                ),
                AddrKind::Rip(_) => (0, 0),
            },
            Op::Imm(_) => panic!("Immediate cannot be a ModRM operand"),
        };
        let rex_r = reg >> 3;

        let rm_is_high8 = matches!(rm, Op::R(r) if r.is_gpr() && r.get_bit() == 8 && (4..8).contains(&r.get_idx()));
        let mut rex = 0x40u8 | ((rex_w as u8) << 3) | (rex_r << 2) | (rex_x << 1) | rex_b;
        if rex == 0x40 && !(force_rex || rm_is_high8) {
            rex = 0;
        }
        if rex != 0 {
            self.db(rex);
        }

        for b in opcode {
            self.db(*b);
        }

        match rm {
            Op::R(r) => {
                self.db(0xC0 | ((reg & 7) << 3) | (r.get_idx() & 7));
            }
            Op::M(m) => match m.kind {
                AddrKind::Expr(e) => self.encode_mem(reg, e),
                AddrKind::Rip(target) => {
                    self.db(((reg & 7) << 3) | 0b101);
                    let disp = target as i64 - (self.size as i64 + 4 + imm_len as i64);
                    self.dd(disp as i32 as u32);
                }
            },
            Op::Imm(_) => unreachable!(),
        }
    }

    fn encode_mem(&mut self, reg: u8, e: RegExp) {
        let base = e.base.expect("Memory operand requires a base register");
        let base_low = base.get_idx() & 7;

        let need_sib = e.index.is_some() || base_low == 4;
        // [RBP]/[R13] with mod=00 means RIP/disp32, so force a disp byte.
        let (modbits, disp_len) = if e.disp == 0 && base_low != 5 {
            (0b00u8, 0)
        } else if (-128..=127).contains(&e.disp) {
            (0b01, 1)
        } else {
            (0b10, 4)
        };

        if need_sib {
            self.db((modbits << 6) | ((reg & 7) << 3) | 0b100);
            let scale_bits = match e.scale {
                1 => 0u8,
                2 => 1,
                4 => 2,
                8 => 3,
                _ => unreachable!(),
            };
            let index_bits = e.index.map_or(0b100, |i| i.get_idx() & 7);
            self.db((scale_bits << 6) | (index_bits << 3) | base_low);
        } else {
            self.db((modbits << 6) | ((reg & 7) << 3) | base_low);
        }

        match disp_len {
            0 => {}
            1 => self.db(e.disp as i8 as u8),
            _ => self.dd(e.disp as u32),
        }
    }

    /// Width plumbing shared by the integer-instruction emitters: returns
    /// (pfx66, rex_w, is8) for a GPR/memory operand width in bits.
    fn int_width(bits: u16) -> (bool, bool, bool) {
        match bits {
            8 => (false, false, true),
            16 => (true, false, false),
            32 => (false, false, false),
            64 => (false, true, false),
            other => panic!("Invalid integer operand width {}", other),
        }
    }

    // -- Integer ALU group --------------------------------------------------

    fn alu(&mut self, base: u8, digit: u8, dst: Op, src: Op) {
        match (dst, src) {
            (Op::R(d), Op::R(s)) => {
                assert_eq!(d.get_bit(), s.get_bit(), "ALU operand width mismatch");
                let (p66, w, is8) = Self::int_width(d.get_bit());
                let opcode = if is8 { base } else { base + 1 };
                let force = is8 && (4..8).contains(&s.get_idx());
                self.encode(p66, None, w, force, &[opcode], s.get_idx(), Op::R(d), 0);
            }
            (Op::R(d), Op::M(m)) => {
                assert_eq!(d.get_bit(), m.get_bit());
                let (p66, w, is8) = Self::int_width(d.get_bit());
                let opcode = if is8 { base + 2 } else { base + 3 };
                let force = is8 && (4..8).contains(&d.get_idx());
                self.encode(p66, None, w, force, &[opcode], d.get_idx(), Op::M(m), 0);
            }
            (Op::M(m), Op::R(s)) => {
                assert_eq!(m.get_bit(), s.get_bit());
                let (p66, w, is8) = Self::int_width(m.get_bit());
                let opcode = if is8 { base } else { base + 1 };
                let force = is8 && (4..8).contains(&s.get_idx());
                self.encode(p66, None, w, force, &[opcode], s.get_idx(), Op::M(m), 0);
            }
            (dst @ (Op::R(_) | Op::M(_)), Op::Imm(imm)) => {
                let bits = dst.bits();
                let (p66, w, is8) = Self::int_width(bits);
                if is8 {
                    assert!((-128..=255).contains(&imm));
                    self.encode(p66, None, w, false, &[0x80], digit, dst, 1);
                    self.db(imm as u8);
                } else if (-128..=127).contains(&imm) {
                    self.encode(p66, None, w, false, &[0x83], digit, dst, 1);
                    self.db(imm as u8);
                } else if bits == 16 {
                    assert!((-32768..=65535).contains(&imm));
                    self.encode(p66, None, w, false, &[0x81], digit, dst, 2);
                    self.dw(imm as u16);
                } else {
                    assert!(
                        (i32::MIN as i64..=u32::MAX as i64).contains(&imm),
                        "ALU immediate {:#x} out of range",
                        imm
                    );
                    self.encode(p66, None, w, false, &[0x81], digit, dst, 4);
                    self.dd(imm as u32);
                }
            }
            _ => panic!("Invalid ALU operand combination"),
        }
    }

    pub fn add(&mut self, dst: impl Into<Op>, src: impl Into<Op>) {
        self.alu(0x00, 0, dst.into(), src.into());
    }

    pub fn or_(&mut self, dst: impl Into<Op>, src: impl Into<Op>) {
        self.alu(0x08, 1, dst.into(), src.into());
    }

    pub fn adc(&mut self, dst: impl Into<Op>, src: impl Into<Op>) {
        self.alu(0x10, 2, dst.into(), src.into());
    }

    pub fn sbb(&mut self, dst: impl Into<Op>, src: impl Into<Op>) {
        self.alu(0x18, 3, dst.into(), src.into());
    }

    pub fn and_(&mut self, dst: impl Into<Op>, src: impl Into<Op>) {
        self.alu(0x20, 4, dst.into(), src.into());
    }

    pub fn sub(&mut self, dst: impl Into<Op>, src: impl Into<Op>) {
        self.alu(0x28, 5, dst.into(), src.into());
    }

    pub fn xor_(&mut self, dst: impl Into<Op>, src: impl Into<Op>) {
        self.alu(0x30, 6, dst.into(), src.into());
    }

    pub fn cmp(&mut self, dst: impl Into<Op>, src: impl Into<Op>) {
        self.alu(0x38, 7, dst.into(), src.into());
    }

    pub fn test(&mut self, dst: impl Into<Op>, src: impl Into<Op>) {
        match (dst.into(), src.into()) {
            (d @ (Op::R(_) | Op::M(_)), Op::R(s)) => {
                let (p66, w, is8) = Self::int_width(s.get_bit());
                let opcode = if is8 { 0x84 } else { 0x85 };
                let force = is8 && (4..8).contains(&s.get_idx());
                self.encode(p66, None, w, force, &[opcode], s.get_idx(), d, 0);
            }
            (d @ (Op::R(_) | Op::M(_)), Op::Imm(imm)) => {
                let bits = d.bits();
                let (p66, w, is8) = Self::int_width(bits);
                if is8 {
                    self.encode(p66, None, w, false, &[0xF6], 0, d, 1);
                    self.db(imm as u8);
                } else {
                    self.encode(p66, None, w, false, &[0xF7], 0, d, 4);
                    self.dd(imm as u32);
                }
            }
            _ => panic!("Invalid test operands"),
        }
    }

    /// `cmp ah, imm8` — the one high-byte access the emitter needs
    /// (decoding LAHF results).
    pub fn cmp_ah(&mut self, imm: u8) {
        self.db(0x80);
        self.db(0xFC);
        self.db(imm);
    }

    // -- mov ----------------------------------------------------------------

    pub fn mov(&mut self, dst: impl Into<Op>, src: impl Into<Op>) {
        match (dst.into(), src.into()) {
            (Op::R(d), Op::R(s)) => {
                assert_eq!(d.get_bit(), s.get_bit(), "mov width mismatch");
                let (p66, w, is8) = Self::int_width(d.get_bit());
                let opcode = if is8 { 0x88 } else { 0x89 };
                let force = is8 && (4..8).contains(&d.get_idx());
                self.encode(p66, None, w, force, &[opcode], s.get_idx(), Op::R(d), 0);
            }
            (Op::R(d), Op::M(m)) => {
                assert_eq!(d.get_bit(), m.get_bit());
                let (p66, w, is8) = Self::int_width(d.get_bit());
                let opcode = if is8 { 0x8A } else { 0x8B };
                let force = is8 && (4..8).contains(&d.get_idx());
                self.encode(p66, None, w, force, &[opcode], d.get_idx(), Op::M(m), 0);
            }
            (Op::M(m), Op::R(s)) => {
                assert_eq!(m.get_bit(), s.get_bit());
                let (p66, w, is8) = Self::int_width(m.get_bit());
                let opcode = if is8 { 0x88 } else { 0x89 };
                let force = is8 && (4..8).contains(&s.get_idx());
                self.encode(p66, None, w, force, &[opcode], s.get_idx(), Op::M(m), 0);
            }
            (Op::R(d), Op::Imm(imm)) => match d.get_bit() {
                64 => {
                    if (i32::MIN as i64..=i32::MAX as i64).contains(&imm) {
                        self.encode(false, None, true, false, &[0xC7], 0, Op::R(d), 4);
                        self.dd(imm as u32);
                    } else {
                        self.mov_abs64(d, imm as u64);
                    }
                }
                32 => {
                    assert!((i32::MIN as i64..=u32::MAX as i64).contains(&imm));
                    let rex_needed = d.get_idx() >= 8;
                    if rex_needed {
                        self.db(0x41);
                    }
                    self.db(0xB8 + (d.get_idx() & 7));
                    self.dd(imm as u32);
                }
                8 => {
                    let force = (4..8).contains(&d.get_idx());
                    if d.get_idx() >= 8 || force {
                        self.db(0x40 | (d.get_idx() >> 3));
                    }
                    self.db(0xB0 + (d.get_idx() & 7));
                    self.db(imm as u8);
                }
                other => panic!("mov r{}, imm unsupported", other),
            },
            (Op::M(m), Op::Imm(imm)) => {
                let (p66, w, is8) = Self::int_width(m.get_bit());
                if is8 {
                    self.encode(p66, None, w, false, &[0xC6], 0, Op::M(m), 1);
                    self.db(imm as u8);
                } else if m.get_bit() == 16 {
                    self.encode(p66, None, w, false, &[0xC7], 0, Op::M(m), 2);
                    self.dw(imm as u16);
                } else {
                    assert!((i32::MIN as i64..=u32::MAX as i64).contains(&imm));
                    self.encode(p66, None, w, false, &[0xC7], 0, Op::M(m), 4);
                    self.dd(imm as u32);
                }
            }
            _ => panic!("Invalid mov operands"),
        }
    }

    /// `mov r64, imm64` in its full 10-byte form. Patch sites depend on the
    /// fixed length, so this never shrinks to a 32-bit immediate.
    pub fn mov_abs64(&mut self, dst: Reg, imm: u64) {
        assert!(dst.is_gpr() && dst.get_bit() == 64);
        self.db(0x48 | (dst.get_idx() >> 3));
        self.db(0xB8 + (dst.get_idx() & 7));
        self.dq(imm);
    }

    pub fn movzx(&mut self, dst: Reg, src: impl Into<Op>) {
        let src = src.into();
        let src_bits = src.bits();
        let (_, w, _) = Self::int_width(dst.get_bit());
        let opcode: &[u8] = match src_bits {
            8 => &[0x0F, 0xB6],
            16 => &[0x0F, 0xB7],
            _ => panic!("movzx source must be 8 or 16 bits"),
        };
        let force = matches!(src, Op::R(r) if src_bits == 8 && (4..8).contains(&r.get_idx()));
        self.encode(false, None, w, force, opcode, dst.get_idx(), src, 0);
    }

    pub fn movsx(&mut self, dst: Reg, src: impl Into<Op>) {
        let src = src.into();
        let src_bits = src.bits();
        let (_, w, _) = Self::int_width(dst.get_bit());
        let opcode: &[u8] = match src_bits {
            8 => &[0x0F, 0xBE],
            16 => &[0x0F, 0xBF],
            _ => panic!("movsx source must be 8 or 16 bits"),
        };
        let force = matches!(src, Op::R(r) if src_bits == 8 && (4..8).contains(&r.get_idx()));
        self.encode(false, None, w, force, opcode, dst.get_idx(), src, 0);
    }

    /// Sign-extending 32→64 move.
    pub fn movsxd(&mut self, dst: Reg, src: impl Into<Op>) {
        assert_eq!(dst.get_bit(), 64);
        let src = src.into();
        assert_eq!(src.bits(), 32);
        self.encode(false, None, true, false, &[0x63], dst.get_idx(), src, 0);
    }

    // -- Unary and multiply -------------------------------------------------

    pub fn not_(&mut self, rm: impl Into<Op>) {
        self.unary_f7(2, rm.into());
    }

    pub fn neg(&mut self, rm: impl Into<Op>) {
        self.unary_f7(3, rm.into());
    }

    fn unary_f7(&mut self, digit: u8, rm: Op) {
        let (p66, w, is8) = Self::int_width(rm.bits());
        let opcode = if is8 { 0xF6 } else { 0xF7 };
        self.encode(p66, None, w, false, &[opcode], digit, rm, 0);
    }

    pub fn imul(&mut self, dst: Reg, src: impl Into<Op>) {
        let src = src.into();
        let (p66, w, _) = Self::int_width(dst.get_bit());
        self.encode(p66, None, w, false, &[0x0F, 0xAF], dst.get_idx(), src, 0);
    }

    pub fn imul3(&mut self, dst: Reg, src: impl Into<Op>, imm: i32) {
        let src = src.into();
        let (p66, w, _) = Self::int_width(dst.get_bit());
        self.encode(p66, None, w, false, &[0x69], dst.get_idx(), src, 4);
        self.dd(imm as u32);
    }

    pub fn lea(&mut self, dst: Reg, m: Address) {
        let (p66, w, _) = Self::int_width(dst.get_bit());
        self.encode(p66, None, w, false, &[0x8D], dst.get_idx(), Op::M(m), 0);
    }

    pub fn xchg(&mut self, a: Reg, b: Reg) {
        assert_eq!(a.get_bit(), b.get_bit());
        let (p66, w, _) = Self::int_width(a.get_bit());
        self.encode(p66, None, w, false, &[0x87], b.get_idx(), Op::R(a), 0);
    }

    // -- Shifts and bit operations -------------------------------------------

    fn shift_imm(&mut self, digit: u8, rm: Op, count: u8) {
        let (p66, w, is8) = Self::int_width(rm.bits());
        let opcode = if is8 { 0xC0 } else { 0xC1 };
        self.encode(p66, None, w, false, &[opcode], digit, rm, 1);
        self.db(count);
    }

    fn shift_cl(&mut self, digit: u8, rm: Op) {
        let (p66, w, is8) = Self::int_width(rm.bits());
        let opcode = if is8 { 0xD2 } else { 0xD3 };
        self.encode(p66, None, w, false, &[opcode], digit, rm, 0);
    }

    pub fn rol(&mut self, rm: impl Into<Op>, count: u8) {
        self.shift_imm(0, rm.into(), count);
    }

    pub fn ror(&mut self, rm: impl Into<Op>, count: u8) {
        self.shift_imm(1, rm.into(), count);
    }

    pub fn rcr(&mut self, rm: impl Into<Op>, count: u8) {
        self.shift_imm(3, rm.into(), count);
    }

    pub fn shl(&mut self, rm: impl Into<Op>, count: u8) {
        self.shift_imm(4, rm.into(), count);
    }

    pub fn shr(&mut self, rm: impl Into<Op>, count: u8) {
        self.shift_imm(5, rm.into(), count);
    }

    pub fn sar(&mut self, rm: impl Into<Op>, count: u8) {
        self.shift_imm(7, rm.into(), count);
    }

    pub fn shl_cl(&mut self, rm: impl Into<Op>) {
        self.shift_cl(4, rm.into());
    }

    pub fn shr_cl(&mut self, rm: impl Into<Op>) {
        self.shift_cl(5, rm.into());
    }

    pub fn sar_cl(&mut self, rm: impl Into<Op>) {
        self.shift_cl(7, rm.into());
    }

    pub fn ror_cl(&mut self, rm: impl Into<Op>) {
        self.shift_cl(1, rm.into());
    }

    pub fn shld(&mut self, dst: Reg, src: Reg, count: u8) {
        assert_eq!(dst.get_bit(), src.get_bit());
        let (p66, w, _) = Self::int_width(dst.get_bit());
        self.encode(p66, None, w, false, &[0x0F, 0xA4], src.get_idx(), Op::R(dst), 1);
        self.db(count);
    }

    pub fn bt(&mut self, rm: impl Into<Op>, bit: u8) {
        let rm = rm.into();
        let (p66, w, _) = Self::int_width(rm.bits());
        self.encode(p66, None, w, false, &[0x0F, 0xBA], 4, rm, 1);
        self.db(bit);
    }

    pub fn bswap(&mut self, r: Reg) {
        let (_, w, _) = Self::int_width(r.get_bit());
        let mut rex = 0x40u8 | ((w as u8) << 3) | (r.get_idx() >> 3);
        if rex == 0x40 {
            rex = 0;
        }
        if rex != 0 {
            self.db(rex);
        }
        self.db(0x0F);
        self.db(0xC8 + (r.get_idx() & 7));
    }

    pub fn bsr(&mut self, dst: Reg, src: impl Into<Op>) {
        let (p66, w, _) = Self::int_width(dst.get_bit());
        self.encode(p66, None, w, false, &[0x0F, 0xBD], dst.get_idx(), src.into(), 0);
    }

    pub fn lzcnt(&mut self, dst: Reg, src: impl Into<Op>) {
        let (_, w, _) = Self::int_width(dst.get_bit());
        self.encode(false, Some(0xF3), w, false, &[0x0F, 0xBD], dst.get_idx(), src.into(), 0);
    }

    /// BMI2 parallel bit extract: `pext dst, src1, src2`.
    pub fn pext(&mut self, dst: Reg, src1: Reg, src2: Reg) {
        assert!(dst.get_bit() == 32 && src1.get_bit() == 32 && src2.get_bit() == 32);
        // VEX.NDS.LZ.F3.0F38.W0 F5 /r
        self.db(0xC4);
        let r = ((dst.get_idx() >> 3) ^ 1) & 1;
        let b = ((src2.get_idx() >> 3) ^ 1) & 1;
        self.db((r << 7) | (1 << 6) | (b << 5) | 0x02);
        let vvvv = (!src1.get_idx()) & 0xF;
        self.db((vvvv << 3) | 0x02);
        self.db(0xF5);
        self.db(0xC0 | ((dst.get_idx() & 7) << 3) | (src2.get_idx() & 7));
    }

    // -- setcc / cmovcc -----------------------------------------------------

    pub fn set_cc(&mut self, cc: Cc, rm: impl Into<Op>) {
        let rm = rm.into();
        assert_eq!(rm.bits(), 8);
        self.encode(false, None, false, false, &[0x0F, 0x90 + cc as u8], 0, rm, 0);
    }

    pub fn setc(&mut self, rm: impl Into<Op>) {
        self.set_cc(Cc::B, rm);
    }

    pub fn setnc(&mut self, rm: impl Into<Op>) {
        self.set_cc(Cc::Nb, rm);
    }

    pub fn setz(&mut self, rm: impl Into<Op>) {
        self.set_cc(Cc::Z, rm);
    }

    pub fn seto(&mut self, rm: impl Into<Op>) {
        self.set_cc(Cc::O, rm);
    }

    pub fn seta(&mut self, rm: impl Into<Op>) {
        self.set_cc(Cc::A, rm);
    }

    pub fn cmov_cc(&mut self, cc: Cc, dst: Reg, src: impl Into<Op>) {
        let (p66, w, _) = Self::int_width(dst.get_bit());
        self.encode(p66, None, w, false, &[0x0F, 0x40 + cc as u8], dst.get_idx(), src.into(), 0);
    }

    pub fn cmovz(&mut self, dst: Reg, src: impl Into<Op>) {
        self.cmov_cc(Cc::Z, dst, src);
    }

    pub fn cmove(&mut self, dst: Reg, src: impl Into<Op>) {
        self.cmov_cc(Cc::Z, dst, src);
    }

    pub fn cmovnb(&mut self, dst: Reg, src: impl Into<Op>) {
        self.cmov_cc(Cc::Nb, dst, src);
    }

    pub fn cmovg(&mut self, dst: Reg, src: impl Into<Op>) {
        self.cmov_cc(Cc::G, dst, src);
    }

    pub fn cmovle(&mut self, dst: Reg, src: impl Into<Op>) {
        self.cmov_cc(Cc::Le, dst, src);
    }

    pub fn cmovbe(&mut self, dst: Reg, src: impl Into<Op>) {
        self.cmov_cc(Cc::Be, dst, src);
    }

    pub fn cmovo(&mut self, dst: Reg, src: impl Into<Op>) {
        self.cmov_cc(Cc::O, dst, src);
    }

    // -- Control flow -------------------------------------------------------

    pub fn j_cc(&mut self, cc: Cc, label: &Label) {
        self.db(0x0F);
        self.db(0x80 + cc as u8);
        self.emit_label_rel32(label);
    }

    pub fn jz(&mut self, label: &Label) {
        self.j_cc(Cc::Z, label);
    }

    pub fn jnz(&mut self, label: &Label) {
        self.j_cc(Cc::Nz, label);
    }

    pub fn je(&mut self, label: &Label) {
        self.j_cc(Cc::Z, label);
    }

    pub fn jne(&mut self, label: &Label) {
        self.j_cc(Cc::Nz, label);
    }

    pub fn ja(&mut self, label: &Label) {
        self.j_cc(Cc::A, label);
    }

    pub fn jbe(&mut self, label: &Label) {
        self.j_cc(Cc::Be, label);
    }

    pub fn jp(&mut self, label: &Label) {
        self.j_cc(Cc::P, label);
    }

    pub fn jnp(&mut self, label: &Label) {
        self.j_cc(Cc::Np, label);
    }

    pub fn jmp(&mut self, label: &Label) {
        self.db(0xE9);
        self.emit_label_rel32(label);
    }

    /// `jmp rel32` to an absolute offset within this buffer. Always 5 bytes.
    pub fn jmp_offset(&mut self, target: usize) {
        let rel = target as i64 - (self.size as i64 + 5);
        self.db(0xE9);
        self.dd(rel as i32 as u32);
    }

    /// `jcc rel32` to an absolute offset within this buffer. Always 6 bytes.
    pub fn j_cc_offset(&mut self, cc: Cc, target: usize) {
        let rel = target as i64 - (self.size as i64 + 6);
        self.db(0x0F);
        self.db(0x80 + cc as u8);
        self.dd(rel as i32 as u32);
    }

    /// `call rel32` to an absolute offset within this buffer. Always 5 bytes.
    pub fn call_offset(&mut self, target: usize) {
        let rel = target as i64 - (self.size as i64 + 5);
        self.db(0xE8);
        self.dd(rel as i32 as u32);
    }

    pub fn jmp_reg(&mut self, r: Reg) {
        assert_eq!(r.get_bit(), 64);
        self.encode(false, None, false, false, &[0xFF], 4, Op::R(r), 0);
    }

    pub fn jmp_mem(&mut self, m: Address) {
        self.encode(false, None, false, false, &[0xFF], 4, Op::M(m), 0);
    }

    pub fn call_reg(&mut self, r: Reg) {
        assert_eq!(r.get_bit(), 64);
        self.encode(false, None, false, false, &[0xFF], 2, Op::R(r), 0);
    }

    pub fn push(&mut self, r: Reg) {
        assert_eq!(r.get_bit(), 64);
        if r.get_idx() >= 8 {
            self.db(0x41);
        }
        self.db(0x50 + (r.get_idx() & 7));
    }

    pub fn pop(&mut self, r: Reg) {
        assert_eq!(r.get_bit(), 64);
        if r.get_idx() >= 8 {
            self.db(0x41);
        }
        self.db(0x58 + (r.get_idx() & 7));
    }

    pub fn ret(&mut self) {
        self.db(0xC3);
    }

    pub fn int3(&mut self) {
        self.db(0xCC);
    }

    pub fn nop(&mut self) {
        self.db(0x90);
    }

    pub fn stc(&mut self) {
        self.db(0xF9);
    }

    pub fn cmc(&mut self) {
        self.db(0xF5);
    }

    pub fn lahf(&mut self) {
        self.db(0x9F);
    }

    pub fn stmxcsr(&mut self, m: Address) {
        assert_eq!(m.get_bit(), 32);
        self.encode(false, None, false, false, &[0x0F, 0xAE], 3, Op::M(m), 0);
    }

    pub fn ldmxcsr(&mut self, m: Address) {
        assert_eq!(m.get_bit(), 32);
        self.encode(false, None, false, false, &[0x0F, 0xAE], 2, Op::M(m), 0);
    }

    // -- SSE ----------------------------------------------------------------

    fn sse(&mut self, pfx66: bool, mandatory: Option<u8>, rex_w: bool, opcode: &[u8], reg: Reg, rm: Op, imm_len: usize) {
        self.encode(pfx66, mandatory, rex_w, false, opcode, reg.get_idx(), rm, imm_len);
    }

    pub fn movd(&mut self, dst: impl Into<Op>, src: impl Into<Op>) {
        match (dst.into(), src.into()) {
            (Op::R(d), s) if d.is_xmm() => self.sse(true, None, false, &[0x0F, 0x6E], d, s, 0),
            (d, Op::R(s)) if s.is_xmm() => self.sse(true, None, false, &[0x0F, 0x7E], s, d, 0),
            _ => panic!("Invalid movd operands"),
        }
    }

    pub fn movq(&mut self, dst: impl Into<Op>, src: impl Into<Op>) {
        match (dst.into(), src.into()) {
            (Op::R(d), Op::R(s)) if d.is_xmm() && s.is_xmm() => {
                self.sse(false, Some(0xF3), false, &[0x0F, 0x7E], d, Op::R(s), 0)
            }
            (Op::R(d), s @ Op::R(_)) if d.is_xmm() => {
                self.sse(true, None, true, &[0x0F, 0x6E], d, s, 0)
            }
            (Op::R(d), s @ Op::M(_)) if d.is_xmm() => {
                self.sse(false, Some(0xF3), false, &[0x0F, 0x7E], d, s, 0)
            }
            (d @ Op::R(_), Op::R(s)) if s.is_xmm() => {
                self.sse(true, None, true, &[0x0F, 0x7E], s, d, 0)
            }
            (d @ Op::M(_), Op::R(s)) if s.is_xmm() => {
                self.sse(true, None, false, &[0x0F, 0xD6], s, d, 0)
            }
            _ => panic!("Invalid movq operands"),
        }
    }

    pub fn movss(&mut self, dst: impl Into<Op>, src: impl Into<Op>) {
        match (dst.into(), src.into()) {
            (Op::R(d), s) if d.is_xmm() => self.sse(false, Some(0xF3), false, &[0x0F, 0x10], d, s, 0),
            (d @ Op::M(_), Op::R(s)) => self.sse(false, Some(0xF3), false, &[0x0F, 0x11], s, d, 0),
            _ => panic!("Invalid movss operands"),
        }
    }

    pub fn movsd(&mut self, dst: impl Into<Op>, src: impl Into<Op>) {
        match (dst.into(), src.into()) {
            (Op::R(d), s) if d.is_xmm() => self.sse(false, Some(0xF2), false, &[0x0F, 0x10], d, s, 0),
            (d @ Op::M(_), Op::R(s)) => self.sse(false, Some(0xF2), false, &[0x0F, 0x11], s, d, 0),
            _ => panic!("Invalid movsd operands"),
        }
    }

    pub fn movaps(&mut self, dst: impl Into<Op>, src: impl Into<Op>) {
        match (dst.into(), src.into()) {
            (Op::R(d), s) if d.is_xmm() => self.sse(false, None, false, &[0x0F, 0x28], d, s, 0),
            (d @ Op::M(_), Op::R(s)) => self.sse(false, None, false, &[0x0F, 0x29], s, d, 0),
            _ => panic!("Invalid movaps operands"),
        }
    }

    pub fn movdqa(&mut self, dst: impl Into<Op>, src: impl Into<Op>) {
        match (dst.into(), src.into()) {
            (Op::R(d), s) if d.is_xmm() => self.sse(true, None, false, &[0x0F, 0x6F], d, s, 0),
            (d @ Op::M(_), Op::R(s)) => self.sse(true, None, false, &[0x0F, 0x7F], s, d, 0),
            _ => panic!("Invalid movdqa operands"),
        }
    }

    pub fn xorps(&mut self, dst: Reg, src: impl Into<Op>) {
        self.sse(false, None, false, &[0x0F, 0x57], dst, src.into(), 0);
    }
}

/// Generates the uniform two-operand SSE emitters: `name(xmm, xmm/mem)`.
macro_rules! sse_ops {
    ($($name:ident: ($pfx66:expr, $mandatory:expr, $($op:expr),+)),* $(,)?) => {
        impl CodeAssembler {
            $(
                pub fn $name(&mut self, dst: Reg, src: impl Into<Op>) {
                    assert!(dst.is_xmm());
                    self.sse($pfx66, $mandatory, false, &[$($op),+], dst, src.into(), 0);
                }
            )*
        }
    };
}

sse_ops! {
    addss: (false, Some(0xF3), 0x0F, 0x58),
    subss: (false, Some(0xF3), 0x0F, 0x5C),
    mulss: (false, Some(0xF3), 0x0F, 0x59),
    divss: (false, Some(0xF3), 0x0F, 0x5E),
    sqrtss: (false, Some(0xF3), 0x0F, 0x51),
    addsd: (false, Some(0xF2), 0x0F, 0x58),
    subsd: (false, Some(0xF2), 0x0F, 0x5C),
    mulsd: (false, Some(0xF2), 0x0F, 0x59),
    divsd: (false, Some(0xF2), 0x0F, 0x5E),
    sqrtsd: (false, Some(0xF2), 0x0F, 0x51),
    minsd: (false, Some(0xF2), 0x0F, 0x5D),
    maxsd: (false, Some(0xF2), 0x0F, 0x5F),
    ucomiss: (false, None, 0x0F, 0x2E),
    comiss: (false, None, 0x0F, 0x2F),
    ucomisd: (true, None, 0x0F, 0x2E),
    comisd: (true, None, 0x0F, 0x2F),
    cvtss2sd: (false, Some(0xF3), 0x0F, 0x5A),
    cvtsd2ss: (false, Some(0xF2), 0x0F, 0x5A),
    pand: (true, None, 0x0F, 0xDB),
    por: (true, None, 0x0F, 0xEB),
    pxor: (true, None, 0x0F, 0xEF),
    paddb: (true, None, 0x0F, 0xFC),
    paddw: (true, None, 0x0F, 0xFD),
    paddsb: (true, None, 0x0F, 0xEC),
    paddsw: (true, None, 0x0F, 0xED),
    paddusb: (true, None, 0x0F, 0xDC),
    paddusw: (true, None, 0x0F, 0xDD),
    psubb: (true, None, 0x0F, 0xF8),
    psubw: (true, None, 0x0F, 0xF9),
    psubsb: (true, None, 0x0F, 0xE8),
    psubsw: (true, None, 0x0F, 0xE9),
    psubusb: (true, None, 0x0F, 0xD8),
    psubusw: (true, None, 0x0F, 0xD9),
    pcmpeqb: (true, None, 0x0F, 0x74),
    pcmpeqw: (true, None, 0x0F, 0x75),
    pmaxub: (true, None, 0x0F, 0xDE),
    pmaxuw: (true, None, 0x0F, 0x38, 0x3E),
    psadbw: (true, None, 0x0F, 0xF6),
    pshufb: (true, None, 0x0F, 0x38, 0x00),
}

impl CodeAssembler {
    /// `cvtsi2ss xmm, r32/r64` — REX.W follows the integer source width.
    pub fn cvtsi2ss(&mut self, dst: Reg, src: Reg) {
        assert!(dst.is_xmm() && src.is_gpr());
        self.sse(false, Some(0xF3), src.get_bit() == 64, &[0x0F, 0x2A], dst, Op::R(src), 0);
    }

    pub fn cvtsi2sd(&mut self, dst: Reg, src: Reg) {
        assert!(dst.is_xmm() && src.is_gpr());
        self.sse(false, Some(0xF2), src.get_bit() == 64, &[0x0F, 0x2A], dst, Op::R(src), 0);
    }

    pub fn cvtsd2si(&mut self, dst: Reg, src: impl Into<Op>) {
        assert!(dst.is_gpr());
        self.sse(
            false,
            Some(0xF2),
            dst.get_bit() == 64,
            &[0x0F, 0x2D],
            Reg::xmm(dst.get_idx()),
            src.into(),
            0,
        );
    }

    pub fn cvttsd2si(&mut self, dst: Reg, src: impl Into<Op>) {
        assert!(dst.is_gpr());
        self.sse(
            false,
            Some(0xF2),
            dst.get_bit() == 64,
            &[0x0F, 0x2C],
            Reg::xmm(dst.get_idx()),
            src.into(),
            0,
        );
    }

    fn cmpsd_pred(&mut self, dst: Reg, src: Op, predicate: u8) {
        assert!(dst.is_xmm());
        self.sse(false, Some(0xF2), false, &[0x0F, 0xC2], dst, src, 1);
        self.db(predicate);
    }

    pub fn cmpltsd(&mut self, dst: Reg, src: impl Into<Op>) {
        self.cmpsd_pred(dst, src.into(), 1);
    }

    pub fn cmpordsd(&mut self, dst: Reg, src: impl Into<Op>) {
        self.cmpsd_pred(dst, src.into(), 7);
    }

    pub fn psrlw(&mut self, dst: Reg, count: u8) {
        assert!(dst.is_xmm());
        self.encode(true, None, false, false, &[0x0F, 0x71], 2, Op::R(dst), 1);
        self.db(count);
    }
}

impl Drop for CodeAssembler {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.buf as *mut libc::c_void, self.capacity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asm() -> CodeAssembler {
        CodeAssembler::new(4096).unwrap()
    }

    #[test]
    fn test_mov_rr() {
        let mut a = asm();
        a.mov(RAX, RCX);
        assert_eq!(a.bytes(), &[0x48, 0x89, 0xC8]);
    }

    #[test]
    fn test_mov_r32_r32() {
        let mut a = asm();
        a.mov(Reg::gpr32(0), Reg::gpr32(9));
        assert_eq!(a.bytes(), &[0x44, 0x89, 0xC8]);
    }

    #[test]
    fn test_mov_imm() {
        let mut a = asm();
        a.mov(Reg::gpr32(1), 0x1234i32);
        assert_eq!(a.bytes(), &[0xB9, 0x34, 0x12, 0x00, 0x00]);
    }

    #[test]
    fn test_mov_abs64_is_ten_bytes() {
        let mut a = asm();
        a.mov_abs64(RCX, 0x1122_3344_5566_7788);
        assert_eq!(
            a.bytes(),
            &[0x48, 0xB9, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn test_mov_mem_disp8() {
        let mut a = asm();
        // mov eax, [r15 + 0x3C]
        a.mov(Reg::gpr32(0), dword_ptr(RegExp::from(R15) + 0x3C));
        assert_eq!(a.bytes(), &[0x41, 0x8B, 0x47, 0x3C]);
    }

    #[test]
    fn test_mov_mem_store_imm() {
        let mut a = asm();
        // mov dword [r15 + 0x3C], 0x1000
        a.mov(dword_ptr(RegExp::from(R15) + 0x3C), 0x1000i32);
        assert_eq!(a.bytes(), &[0x41, 0xC7, 0x47, 0x3C, 0x00, 0x10, 0x00, 0x00]);
    }

    #[test]
    fn test_rsp_base_needs_sib() {
        let mut a = asm();
        a.mov(Reg::gpr32(0), dword_ptr(RegExp::from(RSP) + 8));
        assert_eq!(a.bytes(), &[0x8B, 0x44, 0x24, 0x08]);
    }

    #[test]
    fn test_r13_base_forces_disp() {
        let mut a = asm();
        a.mov(Reg::gpr32(0), dword_ptr(RegExp::from(R13)));
        assert_eq!(a.bytes(), &[0x41, 0x8B, 0x45, 0x00]);
    }

    #[test]
    fn test_sib_index_scale() {
        let mut a = asm();
        // mov rax, [r15 + rax*8 + 0x40]
        a.mov(RAX, qword_ptr(RegExp::from(R15) + RAX * 8u8 + 0x40));
        assert_eq!(a.bytes(), &[0x49, 0x8B, 0x44, 0xC7, 0x40]);
    }

    #[test]
    fn test_alu_imm8_shrink() {
        let mut a = asm();
        a.add(Reg::gpr32(3), 5i32);
        assert_eq!(a.bytes(), &[0x83, 0xC3, 0x05]);
    }

    #[test]
    fn test_alu_imm32() {
        let mut a = asm();
        a.and_(Reg::gpr32(1), 0x7F7F7F7Fi32);
        assert_eq!(a.bytes(), &[0x81, 0xE1, 0x7F, 0x7F, 0x7F, 0x7F]);
    }

    #[test]
    fn test_sub_mem_imm() {
        let mut a = asm();
        // sub qword [r15 + 0x100], 2
        a.sub(qword_ptr(RegExp::from(R15) + 0x100), 2i32);
        assert_eq!(
            a.bytes(),
            &[0x49, 0x83, 0xAF, 0x00, 0x01, 0x00, 0x00, 0x02]
        );
    }

    #[test]
    fn test_shift_imm_and_cl() {
        let mut a = asm();
        a.shl(Reg::gpr32(0), 5);
        a.shr_cl(Reg::gpr32(2));
        assert_eq!(a.bytes(), &[0xC1, 0xE0, 0x05, 0xD3, 0xEA]);
    }

    #[test]
    fn test_setcc_high_regs_get_rex() {
        let mut a = asm();
        a.setc(Reg::gpr8(6)); // SIL needs a REX prefix
        assert_eq!(a.bytes(), &[0x40, 0x0F, 0x92, 0xC6]);
    }

    #[test]
    fn test_movzx_movsx() {
        let mut a = asm();
        a.movzx(Reg::gpr32(0), Reg::gpr8(1));
        a.movsx(Reg::gpr32(2), Reg::gpr16(3));
        assert_eq!(a.bytes(), &[0x0F, 0xB6, 0xC1, 0x0F, 0xBF, 0xD3]);
    }

    #[test]
    fn test_label_forward_backward() {
        let mut a = asm();
        let fwd = a.create_label();
        a.jnz(&fwd); // 6 bytes
        a.nop();
        a.bind(&fwd);
        assert_eq!(a.bytes(), &[0x0F, 0x85, 0x01, 0x00, 0x00, 0x00, 0x90]);

        let back = a.create_label();
        a.bind(&back);
        let pos = a.size();
        a.jmp(&back);
        let rel = i32::from_le_bytes(a.bytes()[pos + 1..pos + 5].try_into().unwrap());
        assert_eq!(rel, -5);
    }

    #[test]
    fn test_jmp_offset_encoding() {
        let mut a = asm();
        a.nop();
        a.nop();
        a.jmp_offset(0);
        assert_eq!(&a.bytes()[2..], &[0xE9, 0xF9, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_patch_site_sizes() {
        let mut a = asm();
        let start = a.size();
        a.j_cc_offset(Cc::G, 0x100);
        assert_eq!(a.size() - start, 6);

        let start = a.size();
        a.mov(dword_ptr(RegExp::from(R15) + 0x3C), 0x2000i32);
        a.jmp_offset(0);
        a.ensure_patch_location_size(start, 13);
        assert_eq!(a.size() - start, 13);

        let start = a.size();
        a.mov_abs64(RCX, 0xDEAD_BEEF);
        assert_eq!(a.size() - start, 10);
    }

    #[test]
    #[should_panic(expected = "overran")]
    fn test_patch_overrun_panics() {
        let mut a = asm();
        let start = a.size();
        a.mov_abs64(RCX, 1);
        a.ensure_patch_location_size(start, 6);
    }

    #[test]
    fn test_sse_basic() {
        let mut a = asm();
        a.addss(XMM1, XMM2);
        assert_eq!(a.bytes(), &[0xF3, 0x0F, 0x58, 0xCA]);
    }

    #[test]
    fn test_sse_high_xmm_rex() {
        let mut a = asm();
        a.paddsb(XMM9, XMM1);
        assert_eq!(a.bytes(), &[0x66, 0x44, 0x0F, 0xEC, 0xC9]);
    }

    #[test]
    fn test_movd_both_directions() {
        let mut a = asm();
        a.movd(XMM1, Reg::gpr32(0));
        a.movd(Reg::gpr32(0), XMM1);
        assert_eq!(a.bytes(), &[0x66, 0x0F, 0x6E, 0xC8, 0x66, 0x0F, 0x7E, 0xC8]);
    }

    #[test]
    fn test_movq_gpr() {
        let mut a = asm();
        a.movq(XMM1, RAX);
        assert_eq!(a.bytes(), &[0x66, 0x48, 0x0F, 0x6E, 0xC8]);
    }

    #[test]
    fn test_cvts() {
        let mut a = asm();
        a.cvttsd2si(Reg::gpr32(0), XMM1);
        assert_eq!(a.bytes(), &[0xF2, 0x0F, 0x2C, 0xC1]);
    }

    #[test]
    fn test_rip_relative() {
        let mut a = asm();
        a.nop();
        // minsd xmm1, [rip -> offset 0x20]
        a.minsd(XMM1, Address::rip(64, 0x20));
        // F2 0F 5D /r with mod=00 rm=101: disp = 0x20 - (1 + 4 + 4) = 0x17
        assert_eq!(&a.bytes()[1..], &[0xF2, 0x0F, 0x5D, 0x0D, 0x17, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_cmp_ah() {
        let mut a = asm();
        a.cmp_ah(0x47);
        assert_eq!(a.bytes(), &[0x80, 0xFC, 0x47]);
    }

    #[test]
    fn test_push_pop_ret() {
        let mut a = asm();
        a.push(RBX);
        a.push(R12);
        a.pop(R12);
        a.pop(RBX);
        a.ret();
        assert_eq!(a.bytes(), &[0x53, 0x41, 0x54, 0x41, 0x5C, 0x5B, 0xC3]);
    }

    #[test]
    fn test_bswap() {
        let mut a = asm();
        a.bswap(Reg::gpr32(0));
        a.bswap(RAX);
        assert_eq!(a.bytes(), &[0x0F, 0xC8, 0x48, 0x0F, 0xC8]);
    }

    #[test]
    fn test_cursor_rewind_rewrite() {
        let mut a = asm();
        let site = a.size();
        a.jmp_offset(0x40);
        a.nop();
        let saved = a.size();
        a.set_size(site);
        a.jmp_offset(0x80);
        a.set_size(saved);
        let rel = i32::from_le_bytes(a.bytes()[site + 1..site + 5].try_into().unwrap());
        assert_eq!(rel, 0x80 - 5);
    }

    #[test]
    fn test_execute_simple_function() {
        // The ultimate encoder check: run a tiny emitted function.
        let mut a = asm();
        // fn(x: u64) -> u64 { x + 42 }
        a.mov(RAX, RDI);
        a.add(RAX, 42i32);
        a.ret();
        let f: extern "sysv64" fn(u64) -> u64 = unsafe { std::mem::transmute(a.top()) };
        assert_eq!(f(100), 142);
    }

    #[test]
    fn test_execute_shifts_and_cmov() {
        let mut a = asm();
        // fn(x: u64, n: u64) -> u64 { if n >= 32 { 0 } else { (x as u32 << n) as u64 } }
        a.mov(RCX, RSI);
        a.mov(RAX, RDI);
        a.shl_cl(Reg::gpr32(0));
        let zero = Reg::gpr32(2);
        a.xor_(zero, zero);
        a.cmp(CL, 32i32);
        a.cmovnb(Reg::gpr32(0), zero);
        a.ret();
        let f: extern "sysv64" fn(u64, u64) -> u64 = unsafe { std::mem::transmute(a.top()) };
        assert_eq!(f(0xDEAD_BEEF, 4), 0xEADB_EEF0);
        assert_eq!(f(0xDEAD_BEEF, 32), 0);
        assert_eq!(f(1, 31), 0x8000_0000);
    }
}
