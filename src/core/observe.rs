use std::sync::Arc;
use std::time::Duration;

use crate::core::error::Error;
use crate::core::request::Request;

/// 请求控制面和生命周期事件的观察者，默认实现都是空操作
pub trait RequestObserver: Send + Sync {
    fn on_resume(&self, _request: &Request) {}

    fn on_suspend(&self, _request: &Request) {}

    fn on_cancel(&self, _request: &Request) {}

    fn on_complete(&self, _request: &Request) {}

    fn on_retry_scheduled(&self, _request: &Request, _error: &Error, _delay: Duration) {}
}

/// 通过 `log` 输出事件
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl RequestObserver for LoggingObserver {
    fn on_resume(&self, request: &Request) {
        log::debug!("请求 #{} 开始 {}", request.id(), request.description().url());
    }

    fn on_suspend(&self, request: &Request) {
        log::debug!("请求 #{} 已暂停", request.id());
    }

    fn on_cancel(&self, request: &Request) {
        log::info!("请求 #{} 已取消", request.id());
    }

    fn on_complete(&self, request: &Request) {
        match request.error() {
            Some(error) => log::warn!(
                "请求 #{} 失败 (重试 {} 次): {}",
                request.id(),
                request.retry_count(),
                error
            ),
            None => log::info!("请求 #{} 完成 (重试 {} 次)", request.id(), request.retry_count()),
        }
    }

    fn on_retry_scheduled(&self, request: &Request, error: &Error, delay: Duration) {
        log::info!(
            "请求 #{} 将在 {:?} 后重试 (第 {} 次): {}",
            request.id(),
            delay,
            request.retry_count() + 1,
            error
        );
    }
}

#[derive(Clone, Default)]
pub(crate) struct Observers {
    observers: Arc<Vec<Arc<dyn RequestObserver>>>,
}

impl Observers {
    pub(crate) fn new(observers: Vec<Arc<dyn RequestObserver>>) -> Self {
        Self { observers: Arc::new(observers) }
    }

    pub(crate) fn each(&self, f: impl Fn(&dyn RequestObserver)) {
        for observer in self.observers.iter() {
            f(observer.as_ref());
        }
    }
}
