//! # Data Models
//!
//! Records the runtime reads and writes. Schema ownership stays with the stores;
//! these types only cover the fields the runtime needs.

pub mod job_state;
pub mod plugin;
pub mod result_record;

pub use job_state::{JobStateRecord, Step, StepStatus};
pub use plugin::PluginDescriptor;
pub use result_record::ResultRecord;
