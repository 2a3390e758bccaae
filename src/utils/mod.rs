pub mod fs;
pub mod runtime;
