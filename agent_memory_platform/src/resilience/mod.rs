//! Circuit breakers, retry scheduling and the guarded invocation path every
//! agent call goes through.

pub mod breaker;
pub mod invoker;
pub mod retry;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitSnapshot, CircuitState, CircuitTable};
pub use invoker::{CallContext, Invocation, ResilientInvoker};
pub use retry::{RetryPolicy, RetryRound, RetryScheduler, RetryTask};
