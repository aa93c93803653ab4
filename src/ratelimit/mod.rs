//! Token bucket admission control and the state it runs on.

mod audit;
mod bucket;
mod clock;
mod key;
mod limiter;
mod resolver;
mod rules;
mod store;

pub use audit::{AuditEvent, AuditSink, ChannelAuditSink, TracingAuditSink};
pub use bucket::{advance, BucketState, Decision, DecisionMetadata};
pub use clock::{Clock, ManualClock, SystemClock};
pub use key::BucketKey;
pub use limiter::RateLimiter;
pub use resolver::{ConfigResolver, DEFAULT_TIER};
pub use rules::{Algorithm, ConfigProvider, InMemoryConfigProvider, RateLimitConfig};
pub use store::{BucketStore, MemoryBucketStore, RedisBucketStore, UpdateFn};
