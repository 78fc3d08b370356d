//! SessionDelegate: 传输层回调的唯一接收端
//!
//! 按任务编号把回调分发给对应的 [`Request`]。找不到请求的回调直接丢弃，
//! 计入异常计数并记录日志。

use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::core::description::RequestDescription;
use crate::core::request::{Completion, Request};
use crate::core::session_manager::{ManagerShared, SessionManager};
use crate::core::transport::{
    AuthChallenge, ChallengeDisposition, Credential, ResponseHead, TaskId, TransportError,
    TransportEvents,
};

/// 决定是否跟随重定向，返回 None 表示拒绝
pub type RedirectHandler =
    Arc<dyn Fn(&Request, &ResponseHead, RequestDescription) -> Option<RequestDescription> + Send + Sync>;

/// 决定响应是否允许缓存
pub type CacheHandler = Arc<dyn Fn(&Request, &ResponseHead) -> bool + Send + Sync>;

/// 处理认证质询
pub type ChallengeHandler =
    Arc<dyn Fn(&Request, &AuthChallenge) -> (ChallengeDisposition, Option<Credential>) + Send + Sync>;

/// 会话级回调钩子，未设置时使用默认行为：跟随重定向、允许缓存、交给传输层默认处理质询
#[derive(Clone, Default)]
pub struct SessionHooks {
    pub redirect: Option<RedirectHandler>,
    pub cache: Option<CacheHandler>,
    pub challenge: Option<ChallengeHandler>,
}

pub struct SessionDelegate {
    tasks: Mutex<HashMap<TaskId, Request>>,
    anomalies: AtomicU64,
    hooks: SessionHooks,
    manager: Weak<ManagerShared>,
}

impl SessionDelegate {
    pub(crate) fn new(hooks: SessionHooks, manager: Weak<ManagerShared>) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            anomalies: AtomicU64::new(0),
            hooks,
            manager,
        }
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<TaskId, Request>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lookup(&self, task: TaskId) -> Option<Request> {
        self.tasks().get(&task).cloned()
    }

    /// 当前登记的任务数
    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks().is_empty()
    }

    /// 被丢弃的回调次数
    pub fn anomalies(&self) -> u64 {
        self.anomalies.load(Ordering::Relaxed)
    }

    pub(crate) fn insert(&self, task: TaskId, request: Request) {
        self.tasks().insert(task, request);
    }

    /// 请求换了新任务：在同一把锁内移除旧编号、登记新编号
    pub(crate) fn replace(&self, previous: Option<TaskId>, task: TaskId, request: Request) {
        let mut tasks = self.tasks();
        if let Some(previous) = previous {
            tasks.remove(&previous);
        }
        let id = request.id();
        tasks.retain(|_, existing| existing.id() != id);
        tasks.insert(task, request);
    }

    pub(crate) fn remove(&self, task: TaskId) -> Option<Request> {
        self.tasks().remove(&task)
    }

    pub(crate) fn drain(&self) -> Vec<Request> {
        self.tasks().drain().map(|(_, request)| request).collect()
    }

    fn dropped(&self, task: TaskId, callback: &str) {
        let count = self.anomalies.fetch_add(1, Ordering::Relaxed) + 1;
        log::warn!("丢弃未知任务 {} 的回调 {} (累计 {} 次)", task, callback, count);
    }

    fn request_for(&self, task: TaskId, callback: &str) -> Option<Request> {
        let request = self.lookup(task);
        if request.is_none() {
            self.dropped(task, callback);
        }
        request
    }
}

impl TransportEvents for SessionDelegate {
    fn did_receive_response(&self, task: TaskId, response: ResponseHead) {
        if let Some(request) = self.request_for(task, "response") {
            if !request.did_receive_response(task, response) {
                log::debug!("请求 #{} 忽略旧任务 {} 的响应", request.id(), task);
            }
        }
    }

    fn did_receive_data(&self, task: TaskId, chunk: Bytes) {
        if let Some(request) = self.request_for(task, "data") {
            if !request.did_receive_data(task, chunk) {
                log::debug!("请求 #{} 忽略旧任务 {} 的数据", request.id(), task);
            }
        }
    }

    fn will_cache_response(&self, task: TaskId, response: &ResponseHead) -> bool {
        let Some(request) = self.request_for(task, "cache") else { return false };
        match &self.hooks.cache {
            Some(handler) => handler(&request, response),
            None => true,
        }
    }

    fn will_perform_redirection(
        &self,
        task: TaskId,
        response: &ResponseHead,
        redirect: RequestDescription,
    ) -> Option<RequestDescription> {
        let request = self.request_for(task, "redirect")?;
        log::debug!("请求 #{} 重定向到 {}", request.id(), redirect.url());
        match &self.hooks.redirect {
            Some(handler) => handler(&request, response, redirect),
            None => Some(redirect),
        }
    }

    fn did_receive_challenge(
        &self,
        task: TaskId,
        challenge: &AuthChallenge,
    ) -> (ChallengeDisposition, Option<Credential>) {
        let Some(request) = self.request_for(task, "challenge") else {
            return (ChallengeDisposition::CancelAuthenticationChallenge, None);
        };
        match &self.hooks.challenge {
            Some(handler) => handler(&request, challenge),
            None => (ChallengeDisposition::PerformDefaultHandling, None),
        }
    }

    fn did_finish_downloading(&self, task: TaskId, location: PathBuf) {
        if let Some(request) = self.request_for(task, "finish-downloading") {
            if !request.did_finish_downloading(task, location) {
                log::debug!("请求 #{} 忽略旧任务 {} 的下载文件", request.id(), task);
            }
        }
    }

    fn did_complete(&self, task: TaskId, error: Option<TransportError>) {
        let Some(request) = self.remove(task) else {
            self.dropped(task, "complete");
            return;
        };
        match request.did_complete(task, error) {
            Completion::Stale => log::debug!("请求 #{} 忽略旧任务 {} 的完成回调", request.id(), task),
            Completion::Succeeded => request.finish(),
            Completion::Failed(error) => match self.manager.upgrade() {
                Some(shared) => SessionManager::from_shared(shared).handle_failure(request, error),
                None => request.finish(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::observe::Observers;
    use crate::core::request::Requestable;
    use crate::core::task::{DataDelegate, DelegateVariant};
    use crate::test_support::{response_head, StubTask};
    use tokio::runtime::Handle;

    fn request(id: u64) -> Request {
        Request::new(
            id,
            Requestable::Data(RequestDescription::get("https://example.com").unwrap()),
            DelegateVariant::Data(DataDelegate::new(None)),
            &Handle::current(),
            Observers::default(),
        )
    }

    #[tokio::test]
    async fn test_unknown_task_callbacks_are_counted() {
        let delegate = SessionDelegate::new(SessionHooks::default(), Weak::new());
        delegate.did_receive_data(42, Bytes::from_static(b"x"));
        delegate.did_receive_response(42, response_head(200, None));
        assert!(!delegate.will_cache_response(42, &response_head(200, None)));
        delegate.did_complete(42, None);
        assert_eq!(delegate.anomalies(), 4);
    }

    #[tokio::test]
    async fn test_replace_keeps_single_entry_per_request() {
        let delegate = SessionDelegate::new(SessionHooks::default(), Weak::new());
        let req = request(1);
        delegate.insert(10, req.clone());
        delegate.insert(20, request(2));

        delegate.replace(Some(10), 11, req.clone());
        assert_eq!(delegate.len(), 2);
        assert!(delegate.lookup(10).is_none());
        assert_eq!(delegate.lookup(11).unwrap().id(), 1);

        // 旧编号已被移除时也不会留下重复条目
        delegate.insert(12, req.clone());
        delegate.replace(None, 13, req);
        assert_eq!(delegate.len(), 2);
        assert!(delegate.lookup(12).is_none());
    }

    #[tokio::test]
    async fn test_completion_without_manager_finishes_request() {
        let delegate = SessionDelegate::new(SessionHooks::default(), Weak::new());
        let req = request(1);
        req.bind(req.description().clone(), StubTask::arc(5));
        delegate.insert(5, req.clone());

        delegate.did_receive_data(5, Bytes::from_static(b"hi"));
        delegate.did_complete(5, None);
        assert!(req.is_finished());
        assert!(delegate.is_empty());
        assert_eq!(delegate.anomalies(), 0);
    }

    #[tokio::test]
    async fn test_hooks_override_defaults() {
        let hooks = SessionHooks {
            redirect: Some(Arc::new(|_: &Request, _: &ResponseHead, _: RequestDescription| None)),
            cache: Some(Arc::new(|_: &Request, _: &ResponseHead| false)),
            challenge: Some(Arc::new(|_: &Request, _: &AuthChallenge| {
                (
                    ChallengeDisposition::UseCredential,
                    Some(Credential { user: "u".into(), password: "p".into() }),
                )
            })),
        };
        let delegate = SessionDelegate::new(hooks, Weak::new());
        delegate.insert(1, request(1));
        let head = response_head(302, None);

        let redirect = RequestDescription::get("https://example.com/next").unwrap();
        assert!(delegate.will_perform_redirection(1, &head, redirect).is_none());
        assert!(!delegate.will_cache_response(1, &head));

        let challenge = AuthChallenge {
            url: head.url.clone(),
            scheme: "Basic realm=\"x\"".into(),
            realm: Some("x".into()),
            previous_failure_count: 0,
        };
        let (disposition, credential) = delegate.did_receive_challenge(1, &challenge);
        assert_eq!(disposition, ChallengeDisposition::UseCredential);
        assert_eq!(credential.unwrap().user, "u");
    }
}
