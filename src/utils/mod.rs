//! Various utilities functions and types

mod clock;
mod fd;

pub use self::clock::*;
pub use self::fd::*;
