mod policy;
mod session;
mod stats;

pub use policy::{decide, Cooldown, Decision, VerificationOutcome};
pub use session::{spawn_session, SessionContext, SessionHandle, VerifierMode};
pub use stats::{PipelineStats, StatsSnapshot};
