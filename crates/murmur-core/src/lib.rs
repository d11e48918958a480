pub mod catalog;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod generator;
pub mod learner;
pub mod ledger;
pub mod lock;
pub mod mixer;
pub mod orchestrator;
pub mod pickup;
pub mod selector;

pub use catalog::*;
pub use clock::*;
pub use config::*;
pub use engine::*;
pub use error::*;
pub use generator::*;
pub use learner::*;
pub use ledger::*;
pub use lock::*;
pub use mixer::*;
pub use orchestrator::*;
pub use pickup::*;
pub use selector::*;
