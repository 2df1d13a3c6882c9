//! Rate limiting logic and state management.

mod backend;
mod clock;
mod counter;
mod key;
mod limiter;
mod rules;

pub use backend::RateLimitBackend;
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::RateLimitEntry;
pub use key::{EndpointClass, RateLimitKey};
pub use limiter::{Decision, RateLimiter};
pub use rules::{RateLimitPolicy, RateLimitRules, RouteRule};
