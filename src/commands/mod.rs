pub mod control;
pub mod daemon;
pub mod utils;

pub use control::run_control_command;
