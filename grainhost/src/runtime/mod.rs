pub mod options;
pub mod types;

pub use options::{LoggingOptions, ProcessStarterOptions, RegistryOptions};
pub use types::{GrainId, GrainInfo, HandleStatus, InstanceId};
