//! Contract between the training runner and the tensor-execution engine.
//!
//! The runner never builds graphs or touches kernels; it only names the
//! inputs it feeds and the outputs it wants back. Everything behind
//! [`Session::run`] belongs to the engine implementation.

pub mod error;
pub mod session;
pub mod value;

pub use error::{EngineErr, Result};
pub use session::{RunOptions, Session};
pub use value::{Tensor, Value};
