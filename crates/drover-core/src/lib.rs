pub mod config;
pub mod error;
pub mod event;
pub mod output;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{DroverError, Result};
pub use event::EventBus;
pub use output::{CapabilityOutput, CapabilityResult, CapabilityStatus, Finding};
pub use traits::{Capability, RecordStore, WorkQueue};
pub use types::*;
