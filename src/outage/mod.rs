pub mod correlator; // origin windows + idle sweep
pub mod pipeline;
pub mod tracker; // per-prefix state machine

pub use correlator::{CorrelatorConfig, OriginCorrelator, OriginOutageWindow};
pub use pipeline::{IngestPipeline, PipelineStats};
pub use tracker::{PrefixReachabilityTracker, TrackerError, UpdateRejected};
