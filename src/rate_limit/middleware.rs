use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project::pin_project;
use tower_layer::Layer;
use tower_service::Service;

use crate::error::GateError;
use crate::rate_limit::SlidingWindowLimiter;

/// A layer that only lets calls through while every guarding key is within its limit.
///
/// Each admitted call counts as one hit on every key.
#[derive(Clone, Debug)]
pub struct RateLimitLayer {
    limiter: SlidingWindowLimiter,
    keys: Arc<[String]>,
}

impl RateLimitLayer {
    pub fn new<I, K>(limiter: SlidingWindowLimiter, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self { limiter, keys: keys.into_iter().map(Into::into).collect() }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService { inner: service, limiter: self.limiter.clone(), keys: self.keys.clone() }
    }
}

/// Middleware service produced by [`RateLimitLayer`].
#[derive(Clone, Debug)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: SlidingWindowLimiter,
    keys: Arc<[String]>,
}

impl<S, Req> Service<Req> for RateLimitService<S>
where
    S: Service<Req>,
{
    type Response = S::Response;
    type Error = GateError<S::Error>;
    type Future = RateLimitFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GateError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        if self.limiter.track_if_within_limit(&self.keys[..]) {
            RateLimitFuture::Admitted { inner: self.inner.call(req) }
        } else {
            let retry_after = self.limiter.next_available(&self.keys[..]);
            tracing::debug!(target: "worksched::rate_limit", ?retry_after, "call rejected by rate limit");
            RateLimitFuture::Limited { retry_after }
        }
    }
}

/// Response future for [`RateLimitService`].
#[pin_project(project = RateLimitFutureProj)]
#[derive(Debug)]
pub enum RateLimitFuture<F> {
    Admitted {
        #[pin]
        inner: F,
    },
    Limited {
        retry_after: Duration,
    },
}

impl<F, T, E> Future for RateLimitFuture<F>
where
    F: Future<Output = Result<T, E>>,
{
    type Output = Result<T, GateError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            RateLimitFutureProj::Admitted { inner } => inner.poll(cx).map_err(GateError::Inner),
            RateLimitFutureProj::Limited { retry_after } => {
                Poll::Ready(Err(GateError::RateLimited { retry_after: *retry_after }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::convert::Infallible;
    use tower::{service_fn, ServiceBuilder, ServiceExt};

    #[tokio::test]
    async fn rejects_calls_beyond_rate_and_recovers() {
        let clock = ManualClock::new();
        let limiter = SlidingWindowLimiter::with_clock(clock.clone());
        limiter.set("sync", 2, Duration::from_secs(10)).unwrap();

        let svc = ServiceBuilder::new()
            .layer(RateLimitLayer::new(limiter.clone(), ["sync"]))
            .service(service_fn(|n: u32| async move { Ok::<_, Infallible>(n * 2) }));

        assert_eq!(svc.clone().oneshot(1).await.unwrap(), 2);
        assert_eq!(svc.clone().oneshot(2).await.unwrap(), 4);

        clock.set(Duration::from_secs(3));
        let err = svc.clone().oneshot(3).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));

        clock.set(Duration::from_secs(10));
        assert_eq!(svc.oneshot(4).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn inner_errors_are_wrapped() {
        let limiter = SlidingWindowLimiter::with_clock(ManualClock::new());
        let svc = RateLimitLayer::new(limiter, Vec::<String>::new())
            .layer(service_fn(|_: ()| async { Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "down")) }));

        let err = svc.oneshot(()).await.unwrap_err();
        assert!(!err.is_rate_limited());
        assert_eq!(err.to_string(), "down");
    }
}
