pub mod audit;
pub mod config;
pub mod crucible_config;
pub mod decisions;
pub mod errors;
pub mod events;
pub mod features;
pub mod gates;
pub mod iteration;
pub mod lock;
pub mod logging;
pub mod monitor;
pub mod phase;
pub mod pipeline;
pub mod tracker;
pub mod ui;
pub mod util;
