//! Cost-weighted per-IP throttling for the HTTP surface.
//!
//! Not all requests are equal: a WebSocket upgrade registers a session and
//! opens bus subscriptions, so it debits a bigger slice of the per-IP
//! budget than a plain HTTP hit, and health probes debit nothing so load
//! balancers are never refused. Frames on an established socket are not
//! throttled here.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::extract::{ConnectInfo, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

/// Sustained refill rate and burst ceiling, in request-cost units.
#[derive(Debug, Clone, Copy)]
pub struct ThrottlePolicy {
    pub per_sec: f64,
    pub burst: f64,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            per_sec: 10.0,
            burst: 30.0,
        }
    }
}

/// Budget units one request debits, by route.
fn request_cost(path: &str) -> f64 {
    match path {
        "/health" => 0.0,
        "/ws" => 5.0,
        "/uploads" => 2.0,
        _ => 1.0,
    }
}

struct Budget {
    remaining: f64,
    refreshed: Instant,
}

/// Per-IP budget table. Budgets refill continuously up to the burst
/// ceiling; a request is admitted only when its full cost is available.
pub struct Throttle {
    policy: ThrottlePolicy,
    budgets: Mutex<HashMap<IpAddr, Budget>>,
}

/// Outcome of one admission check.
pub enum Admission {
    Granted,
    /// Refused; seconds until the same request would fit.
    Refused { retry_after_secs: u64 },
}

impl Throttle {
    pub fn new(policy: ThrottlePolicy) -> Self {
        Self {
            policy,
            budgets: Mutex::new(HashMap::new()),
        }
    }

    /// Debit `cost` units from the address's budget.
    pub fn admit(&self, ip: IpAddr, cost: f64) -> Admission {
        if cost <= 0.0 {
            return Admission::Granted;
        }

        let mut budgets = self.budgets.lock().expect("throttle lock");
        let now = Instant::now();
        let budget = budgets.entry(ip).or_insert(Budget {
            remaining: self.policy.burst,
            refreshed: now,
        });

        let idle = now.duration_since(budget.refreshed).as_secs_f64();
        budget.remaining = (budget.remaining + idle * self.policy.per_sec).min(self.policy.burst);
        budget.refreshed = now;

        if budget.remaining >= cost {
            budget.remaining -= cost;
            Admission::Granted
        } else {
            let deficit = cost - budget.remaining;
            Admission::Refused {
                retry_after_secs: (deficit / self.policy.per_sec).ceil() as u64,
            }
        }
    }

    /// Drop budgets idle longer than `max_idle_secs`. Run periodically so
    /// one-off clients do not accumulate forever.
    pub fn purge_stale(&self, max_idle_secs: f64) {
        let mut budgets = self.budgets.lock().expect("throttle lock");
        let now = Instant::now();
        budgets.retain(|_, b| now.duration_since(b.refreshed).as_secs_f64() < max_idle_secs);
    }

    #[cfg(test)]
    fn tracked_addrs(&self) -> usize {
        self.budgets.lock().unwrap().len()
    }
}

pub async fn throttle_middleware(
    State(throttle): State<Arc<Throttle>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let cost = request_cost(req.uri().path());

    if let Some(ip) = client_ip(&req) {
        if let Admission::Refused { retry_after_secs } = throttle.admit(ip, cost) {
            warn!(ip = %ip, path = %req.uri().path(), "Request throttled");
            return (
                StatusCode::TOO_MANY_REQUESTS,
                [("retry-after", retry_after_secs.to_string())],
            )
                .into_response();
        }
    }

    next.run(req).await
}

/// ConnectInfo first, then X-Forwarded-For, then X-Real-IP.
fn client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    if let Some(info) = req.extensions().get::<ConnectInfo<std::net::SocketAddr>>() {
        return Some(info.0.ip());
    }

    let header_ip = |name: &str, pick_first: bool| -> Option<IpAddr> {
        let value = req.headers().get(name)?.to_str().ok()?;
        let candidate = if pick_first {
            value.split(',').next()?
        } else {
            value
        };
        candidate.trim().parse().ok()
    };

    header_ip("x-forwarded-for", true).or_else(|| header_ip("x-real-ip", false))
}
