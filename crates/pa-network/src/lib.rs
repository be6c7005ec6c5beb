//! Port Authority Network Layer
//!
//! Decides whether a single in-flight request may proceed.
//!
//! Flow:
//! 1. Origin page on the allow list → allow
//! 2. Target classified (pure, no I/O) as local or public
//! 3. Public target → canonical-name lookup, tracker suffix → block
//! 4. Local target from a public page → block as a port scan
//! 5. Anything else → allow
//!
//! Every failure on the way (bad URL, DNS timeout, storage error) allows
//! the request and logs a diagnostic.

mod allow_list;
mod classifier;
mod engine;
mod legacy;
mod tracker;

pub use allow_list::AllowList;
pub use classifier::{ClassificationVerdict, ClassifyError, LocalReason, classify, classify_str};
pub use engine::{
    AllowReason, BlockReason, Decision, DecisionEngine, EngineStats, RequestContext, Verdict,
};
pub use legacy::LegacyPattern;
pub use tracker::{
    CanonicalNameLookup, DnsConfig, HickoryLookup, StaticLookup, TrackerError, TrackerPatterns,
    TrackerResolver,
};
