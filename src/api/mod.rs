use rocket::Route;

use crate::error::{Error, Result};
use crate::limiter::{ClientIp, RateLimiter};

pub mod organizer;
pub mod public;
pub mod voter;

/// Check the caller against a rate limit bucket, turning a denial into the
/// 429 response with its retry hint.
pub(crate) async fn rate_limit(limiter: &RateLimiter, bucket: &str, ip: &ClientIp) -> Result<()> {
    let decision = limiter.allow(bucket, ip).await;
    if decision.allowed {
        Ok(())
    } else {
        Err(Error::RateLimited {
            retry_after: decision.retry_after_seconds,
        })
    }
}

pub fn routes() -> Vec<Route> {
    let mut routes = Vec::new();
    routes.extend(public::routes());
    routes.extend(voter::routes());
    routes.extend(organizer::routes());
    routes
}
