pub mod events;
pub mod live;
pub mod runner;
pub mod sim;

pub use events::{EngineEvent, EventBus};
pub use live::LiveEngine;
pub use runner::{run_live, run_sim, ShutdownSignal};
pub use sim::SimEngine;
