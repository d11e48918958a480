pub mod backoff;
pub mod config;
pub mod governor;
pub mod state;

pub use backoff::*;
pub use config::*;
pub use governor::*;
pub use state::*;
