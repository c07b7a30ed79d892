pub mod clock;
pub mod config;
pub mod eval;
pub mod logging;
pub mod monitoring;
pub mod schedule;
pub mod state;
pub mod types;

#[cfg(test)]
pub mod tests;

pub use clock::*;
pub use config::*;
pub use eval::*;
pub use logging::*;
pub use monitoring::*;
pub use schedule::*;
pub use state::*;
pub use types::*;
