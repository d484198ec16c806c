//! Rate limiting primitives for auth flows.
//!
//! The orchestrator consults the limiter before verifying anything; the
//! default implementation allows everything, deployments swap in a real one.

#[derive(Clone, Copy, Debug)]
pub enum RateLimitAction {
    Login,
    MfaVerify,
    Refresh,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

pub trait RateLimiter: Send + Sync {
    fn check_ip(&self, ip: Option<&str>, action: RateLimitAction) -> RateLimitDecision;
    fn check_email(&self, email: &str, action: RateLimitAction) -> RateLimitDecision;
}

#[derive(Clone, Debug)]
pub struct NoopRateLimiter;

impl RateLimiter for NoopRateLimiter {
    fn check_ip(&self, _ip: Option<&str>, _action: RateLimitAction) -> RateLimitDecision {
        RateLimitDecision::Allowed
    }

    fn check_email(&self, _email: &str, _action: RateLimitAction) -> RateLimitDecision {
        RateLimitDecision::Allowed
    }
}
