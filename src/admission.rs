// src/admission.rs
// =============================================================================
// Admission control: decides when a request may start.
//
// Three independent gates, each optional:
// 1. a smoothed requests-per-second limiter (governor)
// 2. a global concurrency limit (one semaphore)
// 3. a per-host concurrency limit (one semaphore per host, created lazily)
//
// acquire() waits on them in that order and returns an Admission guard.
// Dropping the guard gives the permits back, host first, then global. Every
// wait also listens to the request's cancellation token.
//
// Host gates live in a read-mostly map: a shared lock for lookups and, on a
// miss, an exclusive lock with a second lookup before inserting. Two tasks
// seeing a new host at the same time therefore still end up with the same
// semaphore. Gates are never removed.
// =============================================================================

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, PoisonError, RwLock};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::Config;
use crate::error::FetchError;
use crate::request::Request;

pub struct AdmissionController {
    rate_limiter: Option<DefaultDirectRateLimiter>,
    global: Option<Arc<Semaphore>>,
    per_host_limit: usize,
    hosts: RwLock<HashMap<String, Arc<Semaphore>>>,
}

/// Permits held by one running request.
///
/// Fields drop in declaration order, so the host permit is released before
/// the global one.
#[derive(Debug)]
pub struct Admission {
    _host: Option<OwnedSemaphorePermit>,
    _global: Option<OwnedSemaphorePermit>,
}

impl AdmissionController {
    pub fn new(config: &Config) -> Self {
        Self::with_limits(
            config.requests_per_second,
            config.concurrent_requests,
            config.concurrent_requests_per_domain,
        )
    }

    // Zero disables the corresponding gate.
    pub fn with_limits(requests_per_second: u32, global: usize, per_host: usize) -> Self {
        let rate_limiter = NonZeroU32::new(requests_per_second)
            .map(|rate| RateLimiter::direct(Quota::per_second(rate)));

        let global = if global > 0 {
            Some(Arc::new(Semaphore::new(global)))
        } else {
            None
        };

        Self {
            rate_limiter,
            global,
            per_host_limit: per_host,
            hosts: RwLock::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, req: &Request) -> Result<Admission, FetchError> {
        if let Some(limiter) = &self.rate_limiter {
            tokio::select! {
                biased;
                _ = req.context().cancelled() => return Err(cancelled(req)),
                _ = limiter.until_ready() => {}
            }
        }

        let global = match &self.global {
            Some(semaphore) => Some(wait_for_permit(Arc::clone(semaphore), req).await?),
            None => None,
        };

        let host = if self.per_host_limit > 0 {
            let gate = self.host_gate(&req.host());
            Some(wait_for_permit(gate, req).await?)
        } else {
            None
        };

        Ok(Admission {
            _host: host,
            _global: global,
        })
    }

    /// Returns the gate for `host`, creating it on first use.
    pub fn host_gate(&self, host: &str) -> Arc<Semaphore> {
        {
            let hosts = self.hosts.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(gate) = hosts.get(host) {
                return Arc::clone(gate);
            }
        }

        let mut hosts = self.hosts.write().unwrap_or_else(PoisonError::into_inner);
        let gate = hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)));
        Arc::clone(gate)
    }

    pub fn known_hosts(&self) -> usize {
        self.hosts.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

async fn wait_for_permit(
    semaphore: Arc<Semaphore>,
    req: &Request,
) -> Result<OwnedSemaphorePermit, FetchError> {
    tokio::select! {
        biased;
        _ = req.context().cancelled() => Err(cancelled(req)),
        permit = semaphore.acquire_owned() => permit.map_err(|_| cancelled(req)),
    }
}

fn cancelled(req: &Request) -> FetchError {
    FetchError::Cancelled {
        url: req.url.to_string(),
    }
}
