pub mod covers;

pub use covers::{CoverFixer, CoverStats};
