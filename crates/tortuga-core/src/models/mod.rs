//! Domain models for the intake store.

mod intake;
mod patient;
mod setting;
mod sync;
mod visit;

pub use intake::*;
pub use patient::*;
pub use setting::*;
pub use sync::*;
pub use visit::*;
