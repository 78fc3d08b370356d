//! SessionManager: 请求的唯一工厂
//!
//! 持有传输层、SessionDelegate、适配器和重试器。`SessionManager` 本身是可克隆的句柄，
//! 最后一个句柄释放时会话失效，未完成的任务全部取消。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;

use crate::config::Config;
use crate::core::description::RequestDescription;
use crate::core::encoding::{ParameterEncoding, Parameters};
use crate::core::error::{Error, FetchResult};
use crate::core::observe::{Observers, RequestObserver};
use crate::core::policy::{RequestAdapter, RequestRetrier, RetryResponder, RetryVerdict};
use crate::core::request::{Rebind, Request, Requestable};
use crate::core::session_delegate::{
    CacheHandler, ChallengeHandler, RedirectHandler, SessionDelegate, SessionHooks,
};
use crate::core::task::{DataDelegate, DelegateVariant, DownloadDelegate, DownloadDestination};
use crate::core::transport::{ResumeData, Transport, TransportError, TransportEvents};

pub(crate) struct ManagerShared {
    transport: Arc<dyn Transport>,
    delegate: Arc<SessionDelegate>,
    adapter: Option<Arc<dyn RequestAdapter>>,
    retrier: Option<Arc<dyn RequestRetrier>>,
    observers: Observers,
    start_requests_immediately: bool,
    resume_downloads_on_retry: bool,
    next_request_id: AtomicU64,
    runtime: Handle,
}

impl Drop for ManagerShared {
    fn drop(&mut self) {
        self.transport.invalidate_and_cancel();
        // 回调接收端随会话一起释放，剩下的请求在这里收尾
        for request in self.delegate.drain() {
            request.record_failure(Error::Transport(TransportError::cancelled()));
            request.finish();
        }
    }
}

pub struct SessionManagerBuilder {
    transport: Arc<dyn Transport>,
    adapter: Option<Arc<dyn RequestAdapter>>,
    retrier: Option<Arc<dyn RequestRetrier>>,
    observers: Vec<Arc<dyn RequestObserver>>,
    hooks: SessionHooks,
    start_requests_immediately: bool,
    resume_downloads_on_retry: bool,
    runtime: Option<Handle>,
}

impl SessionManagerBuilder {
    pub fn adapter(mut self, adapter: impl RequestAdapter + 'static) -> Self {
        self.adapter = Some(Arc::new(adapter));
        self
    }

    pub fn retrier(mut self, retrier: impl RequestRetrier + 'static) -> Self {
        self.retrier = Some(Arc::new(retrier));
        self
    }

    pub fn observer(mut self, observer: impl RequestObserver + 'static) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    pub fn redirect_handler(mut self, handler: RedirectHandler) -> Self {
        self.hooks.redirect = Some(handler);
        self
    }

    pub fn cache_handler(mut self, handler: CacheHandler) -> Self {
        self.hooks.cache = Some(handler);
        self
    }

    pub fn challenge_handler(mut self, handler: ChallengeHandler) -> Self {
        self.hooks.challenge = Some(handler);
        self
    }

    /// 为 false 时请求创建后需要调用方手动 `resume()`
    pub fn start_requests_immediately(mut self, start: bool) -> Self {
        self.start_requests_immediately = start;
        self
    }

    /// 下载重试时是否从上次失败留下的续传状态继续
    pub fn resume_downloads_on_retry(mut self, resume: bool) -> Self {
        self.resume_downloads_on_retry = resume;
        self
    }

    /// 指定运行后续操作和重试定时器的运行时，默认取当前运行时
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn config(self, config: &Config) -> Self {
        self.start_requests_immediately(config.start_requests_immediately)
            .resume_downloads_on_retry(config.enable_resume)
    }

    pub fn build(self) -> FetchResult<SessionManager> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current()
                .map_err(|_| Error::Config("SessionManager 必须在 tokio 运行时中创建".to_string()))?,
        };
        let hooks = self.hooks;
        let shared = Arc::new_cyclic(|weak: &Weak<ManagerShared>| ManagerShared {
            transport: self.transport,
            delegate: Arc::new(SessionDelegate::new(hooks, weak.clone())),
            adapter: self.adapter,
            retrier: self.retrier,
            observers: Observers::new(self.observers),
            start_requests_immediately: self.start_requests_immediately,
            resume_downloads_on_retry: self.resume_downloads_on_retry,
            next_request_id: AtomicU64::new(1),
            runtime,
        });
        let events: Arc<dyn TransportEvents> = shared.delegate.clone();
        shared.transport.register(Arc::downgrade(&events));
        Ok(SessionManager { shared })
    }
}

#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<ManagerShared>,
}

impl SessionManager {
    pub fn builder(transport: Arc<dyn Transport>) -> SessionManagerBuilder {
        SessionManagerBuilder {
            transport,
            adapter: None,
            retrier: None,
            observers: Vec::new(),
            hooks: SessionHooks::default(),
            start_requests_immediately: true,
            resume_downloads_on_retry: true,
            runtime: None,
        }
    }

    /// 不带适配器和重试器的会话
    pub fn new(transport: Arc<dyn Transport>) -> FetchResult<Self> {
        Self::builder(transport).build()
    }

    pub(crate) fn from_shared(shared: Arc<ManagerShared>) -> Self {
        Self { shared }
    }

    pub fn runtime(&self) -> &Handle {
        &self.shared.runtime
    }

    pub fn delegate(&self) -> &SessionDelegate {
        &self.shared.delegate
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.shared.transport
    }

    pub fn start_requests_immediately(&self) -> bool {
        self.shared.start_requests_immediately
    }

    /// 创建数据请求
    ///
    /// 适配或创建任务失败时，返回的请求已处于失败状态（错误可以查询），不会抛出。
    pub fn request(&self, description: RequestDescription) -> Request {
        self.dispatch(Requestable::Data(description), DelegateVariant::Data(DataDelegate::new(None)), None)
    }

    /// 按编码方式附加参数后创建数据请求，编码失败时返回失败状态的请求
    pub fn request_encoded(
        &self,
        description: RequestDescription,
        parameters: &Parameters,
        encoding: ParameterEncoding,
    ) -> Request {
        match encoding.encode(description.clone(), parameters) {
            Ok(encoded) => self.request(encoded),
            Err(error) => self.dispatch(
                Requestable::Data(description),
                DelegateVariant::Data(DataDelegate::new(None)),
                Some(error),
            ),
        }
    }

    /// 创建流式数据请求：每个数据块直接交给消费者，不做缓冲
    pub fn request_streaming<F>(&self, description: RequestDescription, consumer: F) -> Request
    where
        F: Fn(bytes::Bytes) + Send + Sync + 'static,
    {
        self.dispatch(
            Requestable::Data(description),
            DelegateVariant::Data(DataDelegate::new(Some(Arc::new(consumer)))),
            None,
        )
    }

    /// 创建下载请求；没有目标时文件留在传输层的临时位置
    pub fn download(&self, description: RequestDescription, destination: Option<DownloadDestination>) -> Request {
        self.dispatch(
            Requestable::Download { description, resume: None },
            DelegateVariant::Download(DownloadDelegate::new(destination)),
            None,
        )
    }

    /// 从续传状态继续下载
    pub fn download_resuming(&self, resume_data: ResumeData, destination: Option<DownloadDestination>) -> Request {
        let description = RequestDescription::from_url(http::Method::GET, resume_data.url.clone());
        self.dispatch(
            Requestable::Download { description, resume: Some(resume_data) },
            DelegateVariant::Download(DownloadDelegate::new(destination)),
            None,
        )
    }

    fn dispatch(&self, requestable: Requestable, variant: DelegateVariant, preset: Option<Error>) -> Request {
        let id = self.shared.next_request_id.fetch_add(1, Ordering::Relaxed);
        let request = Request::new(id, requestable, variant, &self.shared.runtime, self.shared.observers.clone());

        let created = match preset {
            Some(error) => Err(error),
            None => request.requestable().create_task(
                self.shared.transport.as_ref(),
                self.shared.adapter.as_deref(),
                None,
            ),
        };

        match created {
            Ok((adapted, task)) => {
                let task_id = task.id();
                request.bind(adapted, task);
                self.shared.delegate.insert(task_id, request.clone());
                log::debug!("请求 #{} 绑定任务 {}", id, task_id);
                if self.shared.start_requests_immediately {
                    request.resume();
                }
            }
            Err(error) => {
                log::warn!("请求 #{} 创建失败: {}", id, error);
                request.record_failure(error.clone());
                self.handle_failure(request.clone(), error);
            }
        }
        request
    }

    /// 用原始描述重新适配、创建新任务并换入同一个请求
    ///
    /// 只接受当前尝试已失败、且未取消、未最终完成的请求；其余情况以及重新派发失败时
    /// 返回 false，请求保持原状。
    pub fn retry(&self, request: &Request) -> bool {
        self.retry_attempt(request, request.retry_count())
    }

    fn retry_attempt(&self, request: &Request, attempt: u32) -> bool {
        if !request.is_failed_attempt(attempt) {
            return false;
        }
        let resume = if self.shared.resume_downloads_on_retry { request.resume_data() } else { None };
        let created = request.requestable().create_task(
            self.shared.transport.as_ref(),
            self.shared.adapter.as_deref(),
            resume,
        );
        let (adapted, task) = match created {
            Ok(created) => created,
            Err(error) => {
                log::warn!("请求 #{} 重新派发失败: {}", request.id(), error);
                request.record_attempt_failure(attempt, error);
                return false;
            }
        };

        let task_id = task.id();
        match request.rebind(adapted, task, attempt) {
            // 未恢复的新任务直接释放
            Rebind::Rejected => false,
            Rebind::Bound { previous } => {
                self.shared.delegate.replace(previous, task_id, request.clone());
                log::debug!("请求 #{} 第 {} 次重试，绑定任务 {}", request.id(), request.retry_count(), task_id);
                request.resume();
                true
            }
        }
    }

    /// 一次尝试失败后：交给重试器决定，或者直接最终完成
    ///
    /// 决定只作用于失败的那次尝试。等待期间调用方已经手动重试时，迟到的决定被忽略。
    pub(crate) fn handle_failure(&self, request: Request, error: Error) {
        let retrier = match &self.shared.retrier {
            Some(retrier) if error.is_retry_eligible() && !request.is_cancelled() => retrier.clone(),
            _ => {
                request.finish();
                return;
            }
        };

        let attempt = request.retry_count();
        let manager = self.clone();
        self.shared.runtime.spawn(async move {
            let (responder, verdict) = RetryResponder::channel();
            // 重试器在独立任务里运行，panic 时答复端随之释放
            let asking = (manager.clone(), request.clone(), error.clone());
            manager.shared.runtime.spawn(async move {
                let (manager, request, error) = asking;
                retrier.should(&manager, &request, &error, responder);
            });

            match verdict.await {
                Ok(RetryVerdict { should_retry: true, delay }) => {
                    if request.is_cancelled() {
                        request.finish_attempt(attempt);
                        return;
                    }
                    request.observers().each(|o| o.on_retry_scheduled(&request, &error, delay));
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    if !manager.retry_attempt(&request, attempt) {
                        request.finish_attempt(attempt);
                    }
                }
                Ok(_) => request.finish_attempt(attempt),
                Err(_) => {
                    log::warn!("重试器没有答复请求 #{}，按放弃处理", request.id());
                    request.record_attempt_failure(attempt, Error::RetrierDeclined { source: Box::new(error) });
                    request.finish_attempt(attempt);
                }
            }
        });
    }

    /// 立即让会话失效并取消所有未完成的任务
    pub fn invalidate_and_cancel(&self) {
        self.shared.transport.invalidate_and_cancel();
    }
}
