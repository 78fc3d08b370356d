//! 可插拔策略：请求适配器与重试器

use async_trait::async_trait;
use http::header::{HeaderName, HeaderValue, AUTHORIZATION};
use http::HeaderMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::core::description::RequestDescription;
use crate::core::error::{AdaptationError, Error};
use crate::core::request::Request;
use crate::core::session_manager::SessionManager;

/// 派发前检查并改写请求描述
///
/// 必须是输入的纯函数：初次派发和重试都会调用，且可能并发。
pub trait RequestAdapter: Send + Sync {
    fn adapt(&self, description: &RequestDescription) -> Result<RequestDescription, AdaptationError>;
}

impl<F> RequestAdapter for F
where
    F: Fn(&RequestDescription) -> Result<RequestDescription, AdaptationError> + Send + Sync,
{
    fn adapt(&self, description: &RequestDescription) -> Result<RequestDescription, AdaptationError> {
        self(description)
    }
}

/// 注入固定请求头，已存在的同名请求头不覆盖
#[derive(Clone, Debug, Default)]
pub struct HeaderAdapter {
    headers: HeaderMap,
}

impl HeaderAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn bearer(token: &str) -> Result<Self, Error> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|e| {
            Error::InvalidHeader { name: AUTHORIZATION.to_string(), reason: e.to_string() }
        })?;
        value.set_sensitive(true);
        Ok(Self::new().header(AUTHORIZATION, value))
    }
}

impl RequestAdapter for HeaderAdapter {
    fn adapt(&self, description: &RequestDescription) -> Result<RequestDescription, AdaptationError> {
        let mut adapted = description.clone();
        for (name, value) in &self.headers {
            if !adapted.headers().contains_key(name) {
                adapted = adapted.with_header_value(name.clone(), value.clone());
            }
        }
        Ok(adapted)
    }
}

/// 重试器的答复
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryVerdict {
    pub should_retry: bool,
    pub delay: Duration,
}

impl RetryVerdict {
    pub fn retry_after(delay: Duration) -> Self {
        Self { should_retry: true, delay }
    }

    pub fn give_up() -> Self {
        Self { should_retry: false, delay: Duration::ZERO }
    }
}

/// 一次性的答复通道
///
/// `respond` 消耗自身，所以最多答复一次；未答复就被丢弃时，引擎按放弃处理。
pub struct RetryResponder {
    tx: oneshot::Sender<RetryVerdict>,
}

impl RetryResponder {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<RetryVerdict>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn respond(self, should_retry: bool, delay: Duration) {
        self.send(RetryVerdict { should_retry, delay });
    }

    pub fn send(self, verdict: RetryVerdict) {
        if self.tx.send(verdict).is_err() {
            log::debug!("重试答复到达时请求已不再等待");
        }
    }
}

/// 决定失败的请求是否以及何时重试
///
/// 可以花任意长的时间做决定；期间请求停留在失败状态，可以被安全查询。
pub trait RequestRetrier: Send + Sync {
    fn should(&self, manager: &SessionManager, request: &Request, error: &Error, responder: RetryResponder);
}

/// 以 async 方式编写的重试器
#[async_trait]
pub trait AsyncRequestRetrier: Send + Sync + 'static {
    async fn should_retry(&self, manager: &SessionManager, request: &Request, error: &Error) -> RetryVerdict;
}

/// 把 [`AsyncRequestRetrier`] 接到答复式的重试协议上
pub struct AsyncRetrier<R> {
    inner: Arc<R>,
}

impl<R: AsyncRequestRetrier> AsyncRetrier<R> {
    pub fn new(inner: R) -> Self {
        Self { inner: Arc::new(inner) }
    }
}

impl<R: AsyncRequestRetrier> RequestRetrier for AsyncRetrier<R> {
    fn should(&self, manager: &SessionManager, request: &Request, error: &Error, responder: RetryResponder) {
        let inner = self.inner.clone();
        let manager_handle = manager.clone();
        let request = request.clone();
        let error = error.clone();
        manager.runtime().spawn(async move {
            let verdict = inner.should_retry(&manager_handle, &request, &error).await;
            responder.send(verdict);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_adapter_does_not_override() {
        let adapter = HeaderAdapter::bearer("secret").unwrap();
        let plain = RequestDescription::get("https://example.com").unwrap();
        let adapted = adapter.adapt(&plain).unwrap();
        assert_eq!(adapted.headers().get(AUTHORIZATION).unwrap(), "Bearer secret");
        assert!(plain.headers().get(AUTHORIZATION).is_none());

        let explicit = plain.header("authorization", "Basic abc").unwrap();
        let adapted = adapter.adapt(&explicit).unwrap();
        assert_eq!(adapted.headers().get(AUTHORIZATION).unwrap(), "Basic abc");
    }

    #[test]
    fn test_closure_adapter() {
        let reject = |_: &RequestDescription| -> Result<RequestDescription, AdaptationError> {
            Err(AdaptationError::new("没有可用的令牌"))
        };
        let desc = RequestDescription::get("https://example.com").unwrap();
        let err = reject.adapt(&desc).unwrap_err();
        assert_eq!(err.to_string(), "没有可用的令牌");
    }

    #[test]
    fn test_responder_single_shot() {
        let (responder, rx) = RetryResponder::channel();
        let mut verdict = tokio_test::task::spawn(rx);
        tokio_test::assert_pending!(verdict.poll());
        responder.respond(true, Duration::from_millis(5));
        assert!(verdict.is_woken());
        tokio_test::assert_ready_eq!(verdict.poll(), Ok(RetryVerdict::retry_after(Duration::from_millis(5))));

        let (responder, rx) = RetryResponder::channel();
        let mut verdict = tokio_test::task::spawn(rx);
        drop(responder);
        tokio_test::assert_ready_err!(verdict.poll());
    }
}
