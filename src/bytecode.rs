pub mod opcodes;

mod frame;
mod stackmap;
mod stream;
mod transfer;
mod try_catch_block;
mod types;
mod verifier;

pub use frame::*;
pub(crate) use stackmap::StackMapTable;
pub(crate) use stream::{BytecodeStream, CodeData};
pub use try_catch_block::*;
pub use types::*;
pub(crate) use verifier::verify_method;
