//! 机器层：应用与执行参数、单应用实例、实例池

pub mod instance;
pub mod manager;
pub mod types;

pub use instance::{LoadOptions, MachineInstance};
pub use manager::MachineManager;
pub use types::{AdvanceResult, Application, ExecutionParameters, InspectResult};
