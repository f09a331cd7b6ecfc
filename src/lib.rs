#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use
)]

pub mod config;
pub mod cost;
pub mod driver;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod pricing;
pub mod providers;
pub mod retry;

pub use config::DriverConfig;
pub use cost::{CostBreakdown, CostCalculator};
pub use driver::{LlmDriver, ResponseStream, SyncResult};
pub use error::{ErrorKind, ProviderError, Result};
pub use model::{
    ContentPart, FinishReason, FunctionCallRequest, Message, MessageRole, Response, TokenUsage,
};
pub use orchestrator::{FunctionCallOrchestrator, FunctionExecutor};
pub use pricing::{PricingEntry, PricingTable};
pub use providers::{
    AdapterCapabilities, ChatOptions, FunctionSpec, ModelInfo, ProviderAdapter, ProviderKind,
};
