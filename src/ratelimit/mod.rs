//! Rate limiting logic: limits, decisions, codecs and backends.

mod atomic;
mod backend;
mod codec;
pub mod counter;
mod key;
mod limiter;
mod optimistic;
mod rules;

pub use atomic::AtomicBackend;
pub use backend::{Backend, BackendKind, Counter};
pub use codec::{Codec, CodecError, PACKED_LEN};
pub use counter::{decide, BatchDecision, CounterState, Decision};
pub use key::{KeyFormat, DEFAULT_KEY_FORMAT};
pub use limiter::{RateLimiter, Request, Response};
pub use optimistic::OptimisticBackend;
pub use rules::{LimitSet, RateLimit, Zone, DEFAULT_EXPIRY};
