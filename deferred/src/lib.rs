//! Asynchronous coordination primitives.
//!
//! - [`Deferred`] / [`Promise`]: a value settled at most once, observed through
//!   ordered callback lists or by awaiting the promise.
//! - [`when`]: joins several promises into one positional result.
//! - [`Gate`]: a counting barrier for "K independent prerequisites must finish".
//!
//! Nothing here spawns tasks or touches a runtime.

mod deferred;
mod gate;
mod when;

pub use deferred::{Callbacks, Deferred, Promise, State};
pub use gate::{Gate, GateHook};
pub use when::{Operand, when};
