/// Check model, dispatch and probe execution
///
/// - `types` holds check definitions and the job/outcome wire envelopes
/// - `scheduler` fires checks on their period and publishes jobs
/// - `worker` runs the regional pool that executes jobs
/// - `checker` executes a job with the probe matching its protocol
pub mod checker;
pub mod scheduler;
pub mod types;
pub mod worker;

pub use checker::{HttpProbe, Probe, ProbeError, ProbeSet, TcpProbe};
pub use scheduler::{DispatchStats, Scheduler};
pub use types::{CheckDefinition, JobEnvelope, OutcomeEnvelope, ProbeReport, Protocol, RegionTarget};
pub use worker::{WorkerPool, WorkerState};
