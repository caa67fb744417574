pub mod blob;
pub mod bus;
pub mod config;
pub mod error;
pub mod events;
pub mod extract;
pub mod model;
pub mod parser;
pub mod pipeline;
pub mod queue;
pub mod ratelimit;
pub mod service;
pub mod sniff;
pub mod store;
pub mod webhook;

pub use blob::{BlobRef, BlobStore};
pub use bus::EventBus;
pub use config::{load_config, Config};
pub use error::{IngestError, ParseError, Result};
pub use events::{Event, EventType};
pub use model::{
    FileKind, Finding, FindingCategory, FindingSeverity, InspectionRecord, Job, JobState,
    ResultSummary, Tier,
};
pub use pipeline::{Pipeline, Stage};
pub use queue::WorkerPool;
pub use ratelimit::{Bucket, RateLimiter};
pub use service::IngestService;
pub use store::{Database, JobStore, NewJob, NewSubscription, SubscriptionRepo};
pub use webhook::WebhookDispatcher;
