//! Shared types for the genrelay orchestration core: the error taxonomy,
//! provider/model candidates, and call telemetry.

mod candidate;
mod error;
mod telemetry;

pub use candidate::ProviderModel;
pub use error::{ErrorCategory, GenError};
pub use telemetry::{AttemptOutcome, AttemptTelemetry, CallTelemetry, TelemetrySink};
