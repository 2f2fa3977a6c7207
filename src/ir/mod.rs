//! SSA-style intermediate representation consumed by the x64 back end.

pub mod block;
pub mod cond;
pub mod inst;
pub mod location;
pub mod opcode;
pub mod terminal;
pub mod types;
pub mod value;
