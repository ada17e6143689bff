pub mod clock;
pub mod decomposer;
pub mod extraction;
pub mod freshness;
pub mod lock;
pub mod merge;
pub mod orchestrator;
pub mod planner;
pub mod posters;
pub mod refresh;
pub mod settings;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod traits;

pub use clock::{Clock, SystemClock};
pub use decomposer::{Decomposer, ExtractionStep, StepKind, StepTask};
pub use extraction::{ExtractionClient, ExtractionError, StepPayload};
pub use freshness::{Freshness, ScrapeService};
pub use lock::{LockLease, LockManager};
pub use merge::{MergeEngine, MergeStats};
pub use orchestrator::{Orchestrator, ScrapeOutcome, ScrapeState, ScrapeStats};
pub use planner::{RangePlanner, ScrapePlan};
pub use settings::ScrapeSettings;
pub use traits::{LocationStore, MovieStore};
