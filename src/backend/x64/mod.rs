//! x86-64 back end: assembler, register allocator, and per-opcode lowerings.

pub mod abi;
pub mod assembler;
pub mod block_cache;
pub mod block_of_code;
pub mod callback;
pub mod emit;
pub mod emit_context;
pub mod emit_coprocessor;
pub mod emit_data_processing;
pub mod emit_floating_point;
pub mod emit_memory;
pub mod emit_packed;
pub mod emit_saturation;
pub mod emit_state;
pub mod emit_terminal;
pub mod hostloc;
pub mod jit_state;
pub mod patch_info;
pub mod reg_alloc;
