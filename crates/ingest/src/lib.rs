//! The ingest pipeline: security filtering, bot detection, rate limiting,
//! identity + attribution resolution, and the idempotent event write.

mod device;
mod event_writer;
mod filters;
mod pipeline;
mod rate_limit;

pub use event_writer::{EventRecords, EventWriter};
pub use filters::{is_bot, validate_tracking_url};
pub use pipeline::{IngestOutcome, IngestPipeline, IngestRequest, RequestContext};
pub use rate_limit::{RateLimitDecision, RateLimiter, RouteClass};
