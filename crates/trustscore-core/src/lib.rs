//! TrustScore Core Library
//!
//! Verification orchestration for submitted document images: independent
//! evidence layers run concurrently under per-layer timeouts, their scores
//! fold into one verdict, duplicate submissions share a single run and
//! observers follow progress as a stream of events.

pub mod aggregator;
pub mod broadcast;
pub mod config;
pub mod domain;
pub mod engine;
pub mod fakes;
pub mod graph;
pub mod guard;
pub mod layer;
pub mod metrics;
pub mod obs;
pub mod scheduler;
pub mod services;
pub mod store;
pub mod telemetry;

pub use aggregator::{Aggregator, ReportMeta, ScoreSummary};
pub use broadcast::{ProgressBroadcaster, ProgressPublisher, SubscribeError, Subscription};
pub use config::{ConfigError, EngineConfig, LayerPolicies, LayerPolicy, VisionEndpoint};
pub use domain::{
    Fingerprint, FingerprintKey, ImageRef, LayerId, LayerOutcome, OutcomeKind, ProgressEvent,
    ProgressEventKind, RequesterContext, Result, SourceError, Verdict, VerificationId,
    VerificationReport, VerificationRequest, VerifyError,
};
pub use engine::{
    Disposition, ReportHandle, Submission, VerificationEngine, VerificationStatus, Watch,
};
pub use graph::{DependencyGraph, GraphError};
pub use guard::{Claim, IdempotencyGuard};
pub use layer::{Collaborators, Layer, LayerError, LayerFindings, LayerInput, LayerRegistry};
pub use scheduler::Scheduler;
pub use services::{FsImageSource, HttpVisionService, ImageSource};
pub use store::{FsReportStore, MemoryReportStore, ReportStore, StoreError};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
