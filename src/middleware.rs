//! Middleware implementation for reqwest.

use crate::error::{FetchFailure, TransientCause};
use crate::retry::{FetchOperation, RetryOrchestrator};
use crate::session::AttemptContext;

use anyhow::anyhow;
use async_trait::async_trait;
use log::warn;
use parking_lot::Mutex;
use reqwest_middleware::{Error, Middleware, Next, Result};
use std::sync::Arc;

/// Middleware that sends every request through the retry orchestrator:
/// ready proxies first, then a direct attempt.
#[derive(Clone)]
pub struct ProxyPoolMiddleware {
    orchestrator: Arc<RetryOrchestrator>,
}

impl ProxyPoolMiddleware {
    pub fn new(orchestrator: Arc<RetryOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

/// Replays a cloneable request on each attempt's client.
struct ReplayRequest {
    request: Mutex<reqwest::Request>,
}

#[async_trait]
impl FetchOperation for ReplayRequest {
    type Output = reqwest::Response;

    async fn execute(&self, ctx: &AttemptContext) -> std::result::Result<reqwest::Response, FetchFailure> {
        let attempt = self
            .request
            .lock()
            .try_clone()
            .ok_or_else(|| TransientCause::Other("request body is not cloneable".into()))?;

        let response = ctx.client().execute(attempt).await?;
        match response.status().as_u16() {
            403 | 407 | 429 => Err(TransientCause::Blocked(format!("status {}", response.status())).into()),
            code @ 500..=599 => Err(TransientCause::Status(code).into()),
            _ => Ok(response),
        }
    }
}

#[async_trait]
impl Middleware for ProxyPoolMiddleware {
    async fn handle(
        &self,
        req: reqwest::Request,
        _extensions: &mut http::Extensions,
        _next: Next<'_>,
    ) -> Result<reqwest::Response> {
        if req.try_clone().is_none() {
            return Err(Error::Middleware(anyhow!(
                "Request object is not cloneable. Are you passing a streaming body?".to_string()
            )));
        }

        let url = req.url().clone();
        let operation = ReplayRequest {
            request: Mutex::new(req),
        };
        self.orchestrator.execute(&operation).await.map_err(|e| {
            warn!("Request to {} failed on every path: {}", url, e);
            Error::Middleware(anyhow::Error::new(e))
        })
    }
}
