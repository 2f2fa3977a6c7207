//! x86-64 dynamic recompiler back end for a 32-bit ARM guest.
//!
//! The crate takes already-decoded IR basic blocks ([`ir::block::Block`]) and
//! lowers them to executable x86-64 machine code operating on a persistent
//! [`backend::x64::jit_state::JitState`]. The instruction decoder, IR
//! optimisation passes and the outer dispatch loop live in the embedding
//! emulator; only their interfaces appear here.

pub mod arm;
pub mod backend;
pub mod config;
pub mod coprocessor;
pub mod halt_reason;
pub mod ir;

pub use config::{UserCallbacks, UserConfig};
pub use halt_reason::HaltReason;
