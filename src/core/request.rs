//! Request: 一个逻辑请求的句柄
//!
//! 句柄可以随意克隆，所有克隆共享同一份状态。状态（包括当前绑定的 `TaskDelegate`）
//! 由互斥锁保护：调用方的查询/控制与传输回调、重试路径的写入互斥。
//! 回调里的流式消费者、进度回调和观察者都在锁外执行。

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::CONTENT_TYPE;
use std::fmt;
use std::ops::RangeBounds;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::oneshot;

use crate::core::description::RequestDescription;
use crate::core::error::{Error, FetchResult};
use crate::core::observe::Observers;
use crate::core::policy::RequestAdapter;
use crate::core::response::{DataResponse, DownloadResponse, Timeline};
use crate::core::task::{
    move_to_destination, DelegateVariant, Progress, SerialQueue, TaskDelegate,
};
use crate::core::transport::{
    ResponseHead, ResumeData, TaskId, TaskKind, Transport, TransportError, TransportTask,
};

/// 请求的生命周期阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestPhase {
    /// 尚未绑定任务
    Created,
    /// 已绑定任务，尚未恢复
    Dispatched,
    Running,
    Suspended,
    Succeeded,
    Failed,
}

impl RequestPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestPhase::Succeeded | RequestPhase::Failed)
    }
}

/// 校验时可见的信息
pub struct ValidationContext<'a> {
    pub request: Option<&'a RequestDescription>,
    pub response: &'a ResponseHead,
    /// 下载请求和流式请求为 None
    pub data: Option<&'a Bytes>,
}

/// 校验函数，返回 Err 时携带失败原因
pub type Validation = Arc<dyn Fn(&ValidationContext<'_>) -> Result<(), String> + Send + Sync>;

/// 请求的原始描述，重试时据此重新适配和创建任务
#[derive(Clone, Debug)]
pub(crate) enum Requestable {
    Data(RequestDescription),
    Download {
        description: RequestDescription,
        resume: Option<ResumeData>,
    },
}

impl Requestable {
    pub(crate) fn description(&self) -> &RequestDescription {
        match self {
            Requestable::Data(description) => description,
            Requestable::Download { description, .. } => description,
        }
    }

    /// 适配原始描述并创建任务
    pub(crate) fn create_task(
        &self,
        transport: &dyn Transport,
        adapter: Option<&dyn RequestAdapter>,
        resume_override: Option<ResumeData>,
    ) -> FetchResult<(RequestDescription, Arc<dyn TransportTask>)> {
        let adapted = match adapter {
            Some(adapter) => adapter.adapt(self.description())?,
            None => self.description().clone(),
        };
        let kind = match self {
            Requestable::Data(_) => TaskKind::Data,
            Requestable::Download { resume, .. } => TaskKind::Download {
                resume: resume_override.or_else(|| resume.clone()),
            },
        };
        let task = transport.create_task(&adapted, &kind)?;
        Ok((adapted, task))
    }
}

/// 完成回调的处理结果
#[derive(Debug)]
pub(crate) enum Completion {
    /// 回调来自已被替换的任务
    Stale,
    Succeeded,
    Failed(Error),
}

/// 重新绑定的结果
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Rebind {
    Bound { previous: Option<TaskId> },
    /// 请求已取消、已结束或不在预期的失败尝试上，新任务不会被使用
    Rejected,
}

struct RequestState {
    delegate: TaskDelegate,
    adapted: Option<RequestDescription>,
    phase: RequestPhase,
    retry_count: u32,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    cancelled: bool,
    finished: bool,
    validations: Vec<Validation>,
}

impl RequestState {
    fn timeline(&self) -> Timeline {
        Timeline {
            start_time: self.start_time,
            initial_response_time: self.delegate.initial_response_time(),
            end_time: self.end_time,
            retry_count: self.retry_count,
        }
    }

    fn is_failed_attempt(&self, attempt: u32) -> bool {
        !self.cancelled && !self.finished && self.phase == RequestPhase::Failed && self.retry_count == attempt
    }

    fn fail(&mut self, error: Error) {
        self.delegate.replace_error(error);
        self.phase = RequestPhase::Failed;
        self.end_time = Some(Utc::now());
    }
}

struct RequestInner {
    id: u64,
    requestable: Requestable,
    state: Mutex<RequestState>,
    observers: Observers,
}

#[derive(Clone)]
pub struct Request {
    inner: Arc<RequestInner>,
}

impl Request {
    pub(crate) fn new(
        id: u64,
        requestable: Requestable,
        variant: DelegateVariant,
        runtime: &Handle,
        observers: Observers,
    ) -> Self {
        let state = RequestState {
            delegate: TaskDelegate::new(variant, SerialQueue::new(runtime)),
            adapted: None,
            phase: RequestPhase::Created,
            retry_count: 0,
            start_time: None,
            end_time: None,
            cancelled: false,
            finished: false,
            validations: Vec::new(),
        };
        Self {
            inner: Arc::new(RequestInner { id, requestable, state: Mutex::new(state), observers }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RequestState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 创建顺序编号
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// 适配前的原始描述
    pub fn description(&self) -> &RequestDescription {
        self.inner.requestable.description()
    }

    /// 最近一次实际派发的描述
    pub fn adapted_request(&self) -> Option<RequestDescription> {
        self.state().adapted.clone()
    }

    pub fn task_id(&self) -> Option<TaskId> {
        self.state().delegate.task_id()
    }

    pub fn phase(&self) -> RequestPhase {
        self.state().phase
    }

    pub fn is_cancelled(&self) -> bool {
        self.state().cancelled
    }

    /// 是否已最终完成（不会再重试，后续操作已放行）
    pub fn is_finished(&self) -> bool {
        self.state().finished
    }

    pub fn retry_count(&self) -> u32 {
        self.state().retry_count
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.state().start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.state().end_time
    }

    pub fn timeline(&self) -> Timeline {
        self.state().timeline()
    }

    pub fn progress(&self) -> Progress {
        self.state().delegate.progress()
    }

    pub fn error(&self) -> Option<Error> {
        self.state().delegate.error().cloned()
    }

    pub fn response_head(&self) -> Option<ResponseHead> {
        self.state().delegate.response().cloned()
    }

    pub fn data(&self) -> Option<Bytes> {
        self.state().delegate.data()
    }

    pub fn temporary_path(&self) -> Option<PathBuf> {
        self.state().delegate.temporary_path().map(PathBuf::from)
    }

    pub fn destination_path(&self) -> Option<PathBuf> {
        self.state().delegate.destination_path().map(PathBuf::from)
    }

    pub fn resume_data(&self) -> Option<ResumeData> {
        self.state().delegate.resume_data().cloned()
    }

    /// 在锁内读取当前的 `TaskDelegate`
    pub fn with_delegate<R>(&self, f: impl FnOnce(&TaskDelegate) -> R) -> R {
        f(&self.state().delegate)
    }

    pub fn resume(&self) {
        let task = {
            let mut state = self.state();
            let Some(task) = state.delegate.task() else { return };
            if state.cancelled
                || !matches!(state.phase, RequestPhase::Dispatched | RequestPhase::Suspended)
            {
                return;
            }
            if state.start_time.is_none() {
                state.start_time = Some(Utc::now());
            }
            state.phase = RequestPhase::Running;
            task
        };
        task.resume();
        self.inner.observers.each(|o| o.on_resume(self));
    }

    /// 暂停当前任务；已暂停时再次调用不做任何事
    pub fn suspend(&self) {
        let task = {
            let mut state = self.state();
            let Some(task) = state.delegate.task() else { return };
            if state.cancelled
                || !matches!(state.phase, RequestPhase::Dispatched | RequestPhase::Running)
            {
                return;
            }
            state.phase = RequestPhase::Suspended;
            task
        };
        task.suspend();
        self.inner.observers.each(|o| o.on_suspend(self));
    }

    /// 取消请求；取消后的请求不会再被自动重试
    pub fn cancel(&self) {
        let task = {
            let mut state = self.state();
            if state.cancelled || state.finished {
                return;
            }
            let Some(task) = state.delegate.task() else { return };
            state.cancelled = true;
            task
        };
        task.cancel();
        self.inner.observers.each(|o| o.on_cancel(self));
    }

    /// 注册校验，每次尝试在传输成功完成后执行，重试时保留
    pub fn validate<F>(&self, validation: F) -> &Self
    where
        F: Fn(&ValidationContext<'_>) -> Result<(), String> + Send + Sync + 'static,
    {
        self.state().validations.push(Arc::new(validation));
        self
    }

    pub fn validate_status<R>(&self, acceptable: R) -> &Self
    where
        R: RangeBounds<u16> + Send + Sync + 'static,
    {
        self.validate(move |ctx| {
            let status = ctx.response.status.as_u16();
            if acceptable.contains(&status) {
                Ok(())
            } else {
                Err(format!("状态码 {} 不在允许范围内", status))
            }
        })
    }

    /// 要求状态码为 2xx
    pub fn validate_success(&self) -> &Self {
        self.validate_status(200..300)
    }

    /// 要求响应的 Content-Type 匹配其中之一，支持 `*/*` 和 `type/*`
    pub fn validate_content_type(&self, acceptable: &[&str]) -> &Self {
        let acceptable: Vec<String> = acceptable.iter().map(|s| s.to_ascii_lowercase()).collect();
        self.validate(move |ctx| {
            let Some(content_type) = ctx.response.headers.get(CONTENT_TYPE) else {
                return match ctx.data {
                    Some(data) if !data.is_empty() => Err("响应缺少 Content-Type".to_string()),
                    _ => Ok(()),
                };
            };
            let mime = content_type
                .to_str()
                .unwrap_or_default()
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase();
            if acceptable.iter().any(|a| mime_matches(a, &mime)) {
                Ok(())
            } else {
                Err(format!("不接受的 Content-Type: {}", mime))
            }
        })
    }

    pub fn on_progress<F>(&self, handler: F) -> &Self
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.state().delegate.set_progress_handler(Arc::new(handler));
        self
    }

    /// 挂载流式消费者；必须在收到任何数据之前调用，且只能调用一次
    pub fn stream<F>(&self, consumer: F) -> FetchResult<()>
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        self.state().delegate.attach_stream(Arc::new(consumer))
    }

    /// 请求最终完成后在串行队列上执行
    pub fn response<F>(&self, handler: F) -> &Self
    where
        F: FnOnce(DataResponse) + Send + 'static,
    {
        let queue = self.state().delegate.queue();
        let request = self.clone();
        queue.add(move || handler(request.data_snapshot()));
        self
    }

    pub fn download_response<F>(&self, handler: F) -> &Self
    where
        F: FnOnce(DownloadResponse) + Send + 'static,
    {
        let queue = self.state().delegate.queue();
        let request = self.clone();
        queue.add(move || handler(request.download_snapshot()));
        self
    }

    pub async fn data_response(&self) -> DataResponse {
        let (tx, rx) = oneshot::channel();
        self.response(move |response| {
            let _ = tx.send(response);
        });
        match rx.await {
            Ok(response) => response,
            Err(_) => self.data_snapshot(),
        }
    }

    pub async fn download_response_async(&self) -> DownloadResponse {
        let (tx, rx) = oneshot::channel();
        self.download_response(move |response| {
            let _ = tx.send(response);
        });
        match rx.await {
            Ok(response) => response,
            Err(_) => self.download_snapshot(),
        }
    }

    fn data_snapshot(&self) -> DataResponse {
        let state = self.state();
        DataResponse {
            request: state.adapted.clone(),
            response: state.delegate.response().cloned(),
            data: state.delegate.data(),
            error: state.delegate.error().cloned(),
            timeline: state.timeline(),
        }
    }

    fn download_snapshot(&self) -> DownloadResponse {
        let state = self.state();
        DownloadResponse {
            request: state.adapted.clone(),
            response: state.delegate.response().cloned(),
            temporary_path: state.delegate.temporary_path().map(PathBuf::from),
            destination_path: state.delegate.destination_path().map(PathBuf::from),
            resume_data: state.delegate.resume_data().cloned(),
            error: state.delegate.error().cloned(),
            timeline: state.timeline(),
        }
    }

    pub(crate) fn requestable(&self) -> &Requestable {
        &self.inner.requestable
    }

    pub(crate) fn observers(&self) -> &Observers {
        &self.inner.observers
    }

    /// 首次绑定任务
    pub(crate) fn bind(&self, adapted: RequestDescription, task: Arc<dyn TransportTask>) {
        let mut state = self.state();
        state.delegate.bind(task);
        state.adapted = Some(adapted);
        state.phase = RequestPhase::Dispatched;
    }

    /// 请求是否仍停在第 `attempt` 次尝试的失败上，可以重试
    pub(crate) fn is_failed_attempt(&self, attempt: u32) -> bool {
        self.state().is_failed_attempt(attempt)
    }

    /// 重试时换上新任务：旧的累计状态作废，重试次数加一，时间戳清空
    ///
    /// 只接受仍停在第 `attempt` 次失败上的请求；被换下的任务会被取消。
    pub(crate) fn rebind(&self, adapted: RequestDescription, task: Arc<dyn TransportTask>, attempt: u32) -> Rebind {
        let (previous, replaced) = {
            let mut state = self.state();
            if !state.is_failed_attempt(attempt) {
                return Rebind::Rejected;
            }
            let replaced = state.delegate.task();
            let previous = state.delegate.bind(task);
            state.adapted = Some(adapted);
            state.retry_count += 1;
            state.start_time = None;
            state.end_time = None;
            state.phase = RequestPhase::Dispatched;
            (previous, replaced)
        };
        if let Some(replaced) = replaced {
            replaced.cancel();
        }
        Rebind::Bound { previous }
    }

    /// 记录发生在任务之外的失败（适配失败、重新派发失败）
    pub(crate) fn record_failure(&self, error: Error) {
        let mut state = self.state();
        state.fail(error);
    }

    /// 同 `record_failure`，但请求已进入其他尝试或已最终完成时不做任何事
    pub(crate) fn record_attempt_failure(&self, attempt: u32, error: Error) {
        let mut state = self.state();
        if !state.finished && state.retry_count == attempt {
            state.fail(error);
        }
    }

    pub(crate) fn did_receive_response(&self, task: TaskId, response: ResponseHead) -> bool {
        let mut state = self.state();
        if !state.delegate.is_bound_to(task) {
            return false;
        }
        state.delegate.did_receive_response(response);
        true
    }

    pub(crate) fn did_receive_data(&self, task: TaskId, chunk: Bytes) -> bool {
        let dispatch = {
            let mut state = self.state();
            if !state.delegate.is_bound_to(task) {
                return false;
            }
            state.delegate.did_receive_data(&chunk)
        };
        if let Some(consumer) = dispatch.consumer {
            consumer(chunk);
        }
        if let Some(handler) = dispatch.progress_handler {
            handler(dispatch.progress);
        }
        true
    }

    /// 临时文件就绪：按目标函数移动，失败时记录为本次尝试的错误
    pub(crate) fn did_finish_downloading(&self, task: TaskId, location: PathBuf) -> bool {
        let (destination, response) = {
            let mut state = self.state();
            if !state.delegate.is_bound_to(task) {
                return false;
            }
            let destination = state.delegate.did_finish_downloading(location.clone());
            (destination, state.delegate.response().cloned())
        };
        let Some(destination) = destination else { return true };

        let (target, options) = destination(&location, response.as_ref());
        let moved = blocking_fs(|| move_to_destination(&location, &target, options));

        let mut state = self.state();
        if !state.delegate.is_bound_to(task) {
            return false;
        }
        match moved {
            Ok(()) => {
                log::debug!("请求 #{} 下载文件已移动到 {:?}", self.inner.id, target);
                state.delegate.did_move(target);
            }
            Err(error) => state.delegate.record_error(error),
        }
        true
    }

    pub(crate) fn did_complete(&self, task: TaskId, error: Option<TransportError>) -> Completion {
        let pending = {
            let mut state = self.state();
            if !state.delegate.is_bound_to(task) {
                return Completion::Stale;
            }
            if let Some(error) = error {
                if let Some(resume_data) = error.resume_data.clone() {
                    state.delegate.set_resume_data(resume_data);
                }
                state.delegate.record_error(Error::Transport(error));
            }
            state.end_time = Some(Utc::now());
            match state.delegate.response() {
                Some(head) if state.delegate.error().is_none() && !state.validations.is_empty() => Some((
                    state.validations.clone(),
                    state.adapted.clone(),
                    head.clone(),
                    state.delegate.data(),
                )),
                _ => None,
            }
        };

        let failure = pending.and_then(|(validations, request, head, data)| {
            let ctx = ValidationContext { request: request.as_ref(), response: &head, data: data.as_ref() };
            validations
                .iter()
                .find_map(|validation| validation(&ctx).err())
                .map(|reason| Error::ResponseValidation { status: head.status.as_u16(), reason })
        });

        let mut state = self.state();
        if !state.delegate.is_bound_to(task) {
            return Completion::Stale;
        }
        if let Some(error) = failure {
            state.delegate.record_error(error);
        }
        match state.delegate.error().cloned() {
            Some(error) => {
                state.phase = RequestPhase::Failed;
                Completion::Failed(error)
            }
            None => {
                state.phase = RequestPhase::Succeeded;
                Completion::Succeeded
            }
        }
    }

    /// 最终完成：放行串行队列上的后续操作，只生效一次
    pub(crate) fn finish(&self) {
        self.finish_when(|_| true);
    }

    /// 重试决定只对做出决定时的那次尝试生效
    pub(crate) fn finish_attempt(&self, attempt: u32) {
        self.finish_when(|state| state.retry_count == attempt);
    }

    fn finish_when(&self, condition: impl FnOnce(&RequestState) -> bool) {
        let queue = {
            let mut state = self.state();
            if state.finished || !condition(&state) {
                return;
            }
            state.finished = true;
            if !state.phase.is_terminal() {
                state.phase = if state.delegate.error().is_some() {
                    RequestPhase::Failed
                } else {
                    RequestPhase::Succeeded
                };
            }
            if state.end_time.is_none() {
                state.end_time = Some(Utc::now());
            }
            state.delegate.queue()
        };
        queue.release();
        self.inner.observers.each(|o| o.on_complete(self));
    }
}

/// 多线程运行时上让出工作线程再做同步文件操作，其余情况直接执行
fn blocking_fs<T>(operation: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(operation)
        }
        _ => operation(),
    }
}

fn mime_matches(acceptable: &str, actual: &str) -> bool {
    if acceptable == "*/*" || acceptable == actual {
        return true;
    }
    match (acceptable.split_once('/'), actual.split_once('/')) {
        (Some((a_type, "*")), Some((b_type, _))) => a_type == b_type,
        _ => false,
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Request")
            .field("id", &self.inner.id)
            .field("url", &self.description().url().as_str())
            .field("phase", &state.phase)
            .field("retry_count", &state.retry_count)
            .field("cancelled", &state.cancelled)
            .finish()
    }
}
