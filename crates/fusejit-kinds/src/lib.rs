//! C op kinds for `fusejit`.
//!
//! Every kind here reads its inputs through the shared
//! [`STRIDED_OFFSET_BLOCK`](support::STRIDED_OFFSET_BLOCK) helper, so inputs may use any layout;
//! outputs are always dense row-major.

pub mod elementwise;
pub mod reduce;
pub mod scale;
pub mod support;

pub use elementwise::{BinaryOp, ElementwiseBinary, ElementwiseUnary, UnaryOp};
pub use reduce::ReduceSum;
pub use scale::Scale;
pub use support::{strided_offset_block, STRIDED_OFFSET_BLOCK, STRIDED_OFFSET_FN};
