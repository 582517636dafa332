pub mod defer;
pub mod fs;
pub mod sync;
