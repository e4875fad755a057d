//! Network access: rate tracking, request signatures and the conditional cache

mod cache;
mod mode;
mod rate;
mod request;
mod transport;

pub use cache::{CacheEntry, CacheInfo, CacheStore};
pub use mode::CacheMode;
pub use rate::{Clock, ManualClock, RateLimiter, RateState, SystemClock};
pub use request::{checksum, CacheRequest, HttpRequest, HttpResponse};
pub use transport::{ReqwestTransport, StubTransport, Transport};
