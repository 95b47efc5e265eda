//! Failsafe building blocks for Timely pipelines.
//!
//! Elements that fail processing are carried forward as
//! [`FailsafeElement`]s instead of crashing the pipeline, encoded with
//! a [`coders::Coder`] and parked in a dead letter store.
//!
//! [`run::cli_main`] is the entry point for pipeline binaries. See
//! [`worker::Pipeline`] for how a pipeline is described.

#[macro_use]
pub(crate) mod macros;

pub mod coders;
pub mod dataflow;
pub mod datadog;
pub mod deadletter;
pub mod dofn;
pub mod errors;
pub mod metrics;
pub mod mutations;
pub mod operators;
pub mod options;
pub mod run;
pub mod spanner;
pub mod tracing;
pub mod values;
pub(crate) mod webserver;
pub mod worker;

pub use crate::dataflow::StepId;
pub use crate::errors::FlowException;
pub use crate::errors::TrackedError;
pub use crate::options::PipelineOptions;
pub use crate::values::FailsafeElement;
pub use crate::worker::Pipeline;
pub use crate::worker::WorkerContext;
