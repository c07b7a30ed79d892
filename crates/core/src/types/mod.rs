pub mod error;
pub mod labels;
pub mod rule;

pub use error::*;
pub use labels::*;
pub use rule::*;
