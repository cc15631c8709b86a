mod file;
mod hash;
pub mod similarity;

pub use file::*;
pub use hash::*;
