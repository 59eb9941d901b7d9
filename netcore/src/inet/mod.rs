//! Family-tagged IP endpoint value type.

mod address;

pub use address::{Address, Family};
