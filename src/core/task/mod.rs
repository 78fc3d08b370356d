//! `task` 模块包含单次底层任务的状态
//!
//! 主要包括：
//! - `TaskDelegate`: 把传输回调整理成累计数据、进度和终止错误
//! - `data`: 数据任务（缓冲或流式）
//! - `download`: 下载任务（临时文件、目标移动、续传状态）
//! - `queue`: 任务完成后执行后续操作的串行队列

pub mod data;
pub mod download;
pub(crate) mod queue;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::core::error::{Error, FetchResult};
use crate::core::transport::{ResponseHead, ResumeData, TaskId, TransportTask};

pub use self::data::{DataDelegate, StreamConsumer};
pub use self::download::{
    fixed_destination, move_to_destination, suggested_destination, suggested_filename,
    DownloadDelegate, DownloadDestination, DownloadOptions,
};
pub(crate) use self::queue::SerialQueue;

/// 进度：已完成字节数 / 总字节数，总数未知时为 None
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: u64,
    pub total: Option<u64>,
}

impl Progress {
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) => Some(1.0),
            Some(total) => Some(self.completed as f64 / total as f64),
            None => None,
        }
    }
}

pub type ProgressHandler = Arc<dyn Fn(Progress) + Send + Sync>;

/// 数据块回调需要在锁外执行的动作
pub(crate) struct ChunkDispatch {
    pub(crate) consumer: Option<StreamConsumer>,
    pub(crate) progress_handler: Option<ProgressHandler>,
    pub(crate) progress: Progress,
}

pub enum DelegateVariant {
    Data(DataDelegate),
    Download(DownloadDelegate),
}

/// 单个请求当前绑定的任务状态
///
/// 同一个 `TaskDelegate` 在重试时被重新绑定到新的底层任务，`bind` 会清空累计状态；
/// 串行队列、进度回调和流式消费者跨越多次尝试保留。
pub struct TaskDelegate {
    task: Option<Arc<dyn TransportTask>>,
    queue: Arc<SerialQueue>,
    progress: Progress,
    error: Option<Error>,
    response: Option<ResponseHead>,
    initial_response_time: Option<DateTime<Utc>>,
    progress_handler: Option<ProgressHandler>,
    variant: DelegateVariant,
}

impl TaskDelegate {
    pub(crate) fn new(variant: DelegateVariant, queue: SerialQueue) -> Self {
        Self {
            task: None,
            queue: Arc::new(queue),
            progress: Progress::default(),
            error: None,
            response: None,
            initial_response_time: None,
            progress_handler: None,
            variant,
        }
    }

    /// 绑定新的底层任务并重置累计状态，返回之前绑定的任务编号
    pub(crate) fn bind(&mut self, task: Arc<dyn TransportTask>) -> Option<TaskId> {
        let previous = self.task.replace(task).map(|t| t.id());
        self.reset();
        previous
    }

    fn reset(&mut self) {
        self.progress = Progress::default();
        self.error = None;
        self.response = None;
        self.initial_response_time = None;
        match &mut self.variant {
            DelegateVariant::Data(data) => data.reset(),
            DelegateVariant::Download(download) => download.reset(),
        }
    }

    pub fn task_id(&self) -> Option<TaskId> {
        self.task.as_ref().map(|t| t.id())
    }

    pub(crate) fn task(&self) -> Option<Arc<dyn TransportTask>> {
        self.task.clone()
    }

    pub(crate) fn is_bound_to(&self, id: TaskId) -> bool {
        self.task_id() == Some(id)
    }

    pub(crate) fn queue(&self) -> Arc<SerialQueue> {
        self.queue.clone()
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn response(&self) -> Option<&ResponseHead> {
        self.response.as_ref()
    }

    pub fn initial_response_time(&self) -> Option<DateTime<Utc>> {
        self.initial_response_time
    }

    pub fn variant(&self) -> &DelegateVariant {
        &self.variant
    }

    /// 已缓冲的数据，下载任务或流式模式下为 None
    pub fn data(&self) -> Option<Bytes> {
        match &self.variant {
            DelegateVariant::Data(data) => data.data(),
            DelegateVariant::Download(_) => None,
        }
    }

    pub fn temporary_path(&self) -> Option<&Path> {
        match &self.variant {
            DelegateVariant::Download(download) => download.temporary_path(),
            DelegateVariant::Data(_) => None,
        }
    }

    pub fn destination_path(&self) -> Option<&Path> {
        match &self.variant {
            DelegateVariant::Download(download) => download.destination_path(),
            DelegateVariant::Data(_) => None,
        }
    }

    pub fn resume_data(&self) -> Option<&ResumeData> {
        match &self.variant {
            DelegateVariant::Download(download) => download.resume_data(),
            DelegateVariant::Data(_) => None,
        }
    }

    pub(crate) fn set_progress_handler(&mut self, handler: ProgressHandler) {
        self.progress_handler = Some(handler);
    }

    pub(crate) fn attach_stream(&mut self, consumer: StreamConsumer) -> FetchResult<()> {
        let received = self.progress.completed;
        match &mut self.variant {
            DelegateVariant::Data(data) => data.attach_stream(consumer, received),
            DelegateVariant::Download(_) => Err(Error::StreamAttach),
        }
    }

    pub(crate) fn did_receive_response(&mut self, response: ResponseHead) {
        if self.initial_response_time.is_none() {
            self.initial_response_time = Some(Utc::now());
        }
        self.progress.total = response.expected_content_length();
        self.response = Some(response);
    }

    pub(crate) fn did_receive_data(&mut self, chunk: &Bytes) -> ChunkDispatch {
        self.progress.completed += chunk.len() as u64;
        let consumer = match &mut self.variant {
            DelegateVariant::Data(data) => data.did_receive_data(chunk),
            DelegateVariant::Download(_) => None,
        };
        ChunkDispatch {
            consumer,
            progress_handler: self.progress_handler.clone(),
            progress: self.progress,
        }
    }

    pub(crate) fn did_finish_downloading(&mut self, location: std::path::PathBuf) -> Option<DownloadDestination> {
        match &mut self.variant {
            DelegateVariant::Download(download) => {
                download.did_finish_downloading(location);
                download.destination()
            }
            DelegateVariant::Data(_) => None,
        }
    }

    pub(crate) fn did_move(&mut self, destination: std::path::PathBuf) {
        if let DelegateVariant::Download(download) = &mut self.variant {
            download.did_move(destination);
        }
    }

    pub(crate) fn set_resume_data(&mut self, resume_data: ResumeData) {
        if let DelegateVariant::Download(download) = &mut self.variant {
            download.set_resume_data(resume_data);
        }
    }

    /// 记录本次尝试的错误，只保留第一个
    pub(crate) fn record_error(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// 覆盖错误，用于重新派发失败这类发生在绑定之外的错误
    pub(crate) fn replace_error(&mut self, error: Error) {
        self.error = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StubTask;
    use http::{HeaderMap, StatusCode};
    use tokio::runtime::Handle;
    use url::Url;

    fn response_with_length(length: Option<u64>) -> ResponseHead {
        let mut headers = HeaderMap::new();
        if let Some(length) = length {
            headers.insert(http::header::CONTENT_LENGTH, length.to_string().parse().unwrap());
        }
        ResponseHead::new(Url::parse("https://example.com/f").unwrap(), StatusCode::OK, headers)
    }

    #[tokio::test]
    async fn test_progress_total_unknown_until_response() {
        let mut delegate = TaskDelegate::new(
            DelegateVariant::Data(DataDelegate::new(None)),
            SerialQueue::new(&Handle::current()),
        );
        delegate.bind(StubTask::arc(1));
        assert_eq!(delegate.progress(), Progress { completed: 0, total: None });

        delegate.did_receive_response(response_with_length(Some(10)));
        let dispatch = delegate.did_receive_data(&Bytes::from_static(b"12345"));
        assert_eq!(dispatch.progress, Progress { completed: 5, total: Some(10) });
        assert_eq!(delegate.progress().fraction(), Some(0.5));
    }

    #[tokio::test]
    async fn test_bind_resets_accumulated_state() {
        let mut delegate = TaskDelegate::new(
            DelegateVariant::Data(DataDelegate::new(None)),
            SerialQueue::new(&Handle::current()),
        );
        assert_eq!(delegate.bind(StubTask::arc(1)), None);
        delegate.did_receive_response(response_with_length(None));
        delegate.did_receive_data(&Bytes::from_static(b"stale"));
        delegate.record_error(Error::Encoding("x".into()));

        assert_eq!(delegate.bind(StubTask::arc(2)), Some(1));
        assert_eq!(delegate.task_id(), Some(2));
        assert!(delegate.error().is_none());
        assert!(delegate.response().is_none());
        assert_eq!(delegate.progress(), Progress::default());
        assert_eq!(delegate.data().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_first_error_wins() {
        let mut delegate = TaskDelegate::new(
            DelegateVariant::Download(DownloadDelegate::new(None)),
            SerialQueue::new(&Handle::current()),
        );
        delegate.record_error(Error::Encoding("first".into()));
        delegate.record_error(Error::Encoding("second".into()));
        assert!(matches!(delegate.error(), Some(Error::Encoding(m)) if m == "first"));

        delegate.replace_error(Error::Config("override".into()));
        assert!(matches!(delegate.error(), Some(Error::Config(_))));
        assert!(delegate.data().is_none());
        assert!(matches!(delegate.attach_stream(Arc::new(|_| {})), Err(Error::StreamAttach)));
    }
}
