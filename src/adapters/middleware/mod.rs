//! The gateway's request pipeline.
//!
//! A [`Chain`] is an ordered list of [`Middleware`] stages in front of a
//! terminal [`RequestHandler`]. The first stage added is the outermost one: it
//! sees the request first and the response last. The gateway always runs the
//! stages in this order:
//!
//! 1. [`AccessLog`]
//! 2. [`BodyLimit`]
//! 3. [`RouteMatcher`]
//! 4. [`Authenticate`]
//! 5. [`RateLimit`]
//!
//! Operational endpoints listed in [`ExemptPaths`] skip stages 2–5.
use std::{collections::HashSet, sync::Arc};

use crate::ports::pipeline::{Middleware, RequestHandler};

mod access_log;
mod auth;
mod body_limit;
mod rate_limit;
mod route_matcher;

pub use access_log::{AccessLog, REQUEST_ID_HEADER};
pub use auth::Authenticate;
pub use body_limit::BodyLimit;
pub use rate_limit::{RateLimit, select_policy};
pub use route_matcher::RouteMatcher;

/// Ordered stage list under construction.
#[derive(Default)]
pub struct Chain {
    stages: Vec<Arc<dyn Middleware>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage inside every stage added so far.
    pub fn with<M: Middleware>(mut self, stage: M) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Close the chain over `terminal`, producing the handler for the outermost stage.
    pub fn then(self, terminal: Arc<dyn RequestHandler>) -> Arc<dyn RequestHandler> {
        self.stages
            .into_iter()
            .rev()
            .fold(terminal, |next, stage| stage.wrap(next))
    }
}

/// Paths served by the gateway itself. Matched exactly, never by prefix.
#[derive(Debug, Clone, Default)]
pub struct ExemptPaths {
    paths: HashSet<String>,
}

impl ExemptPaths {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.contains(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::body::Body;
    use hyper::{Request, Response};

    use super::{test_support::Reflect, *};
    use crate::core::RequestContext;

    struct Record {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Record {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn handle(
            &self,
            req: Request<Body>,
            ctx: &mut RequestContext,
            next: &dyn RequestHandler,
        ) -> Response<Body> {
            self.log.lock().unwrap().push(format!("enter {}", self.name));
            let response = next.handle(req, ctx).await;
            self.log.lock().unwrap().push(format!("leave {}", self.name));
            response
        }
    }

    #[tokio::test]
    async fn test_first_stage_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = Chain::new()
            .with(Record {
                name: "a",
                log: log.clone(),
            })
            .with(Record {
                name: "b",
                log: log.clone(),
            });
        assert_eq!(chain.stage_names(), vec!["a", "b"]);

        let handler = chain.then(Arc::new(Reflect));
        let mut ctx = RequestContext::default();
        handler
            .handle(Request::new(Body::empty()), &mut ctx)
            .await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["enter a", "enter b", "leave b", "leave a"]
        );
    }

    #[tokio::test]
    async fn test_empty_chain_is_terminal() {
        let handler = Chain::new().then(Arc::new(Reflect));
        let mut ctx = RequestContext::default();
        let response = handler.handle(Request::new(Body::empty()), &mut ctx).await;
        assert_eq!(response.status(), hyper::StatusCode::OK);
    }

    #[test]
    fn test_exempt_paths_match_exactly() {
        let exempt = ExemptPaths::new(["/health", "/version"]);
        assert!(exempt.contains("/health"));
        assert!(!exempt.contains("/health/"));
        assert!(!exempt.contains("/healthz"));
    }
}
