//! 测试用的传输层替身

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tempfile::TempDir;
use tokio::runtime::Handle;
use tokio::sync::watch;
use url::Url;

use crate::core::description::RequestDescription;
use crate::core::transport::{
    ResponseHead, ResumeData, TaskId, TaskKind, Transport, TransportError, TransportErrorKind,
    TransportEvents, TransportTask,
};

pub(crate) fn response_head(status: u16, content_length: Option<u64>) -> ResponseHead {
    let mut headers = HeaderMap::new();
    if let Some(length) = content_length {
        headers.insert(http::header::CONTENT_LENGTH, length.to_string().parse().unwrap());
    }
    ResponseHead::new(
        Url::parse("https://example.com/").unwrap(),
        StatusCode::from_u16(status).unwrap(),
        headers,
    )
}

/// 只记录控制调用的任务
pub(crate) struct StubTask {
    id: TaskId,
    calls: Mutex<Vec<&'static str>>,
}

impl StubTask {
    pub(crate) fn arc(id: TaskId) -> Arc<StubTask> {
        Arc::new(StubTask { id, calls: Mutex::new(Vec::new()) })
    }

    pub(crate) fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

impl TransportTask for StubTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn resume(&self) {
        self.calls.lock().unwrap().push("resume");
    }

    fn suspend(&self) {
        self.calls.lock().unwrap().push("suspend");
    }

    fn cancel(&self) {
        self.calls.lock().unwrap().push("cancel");
    }
}

/// 一次尝试中按顺序投递的回调
#[derive(Clone, Debug)]
pub(crate) enum Step {
    Response { status: u16, content_length: Option<u64> },
    Chunk(Bytes),
    Fail(TransportError),
    Succeed,
    /// 一直挂起直到任务被取消
    Hang,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Control {
    Suspended,
    Running,
    Cancelled,
}

/// 按脚本投递回调的传输层
///
/// 每创建一个任务消耗一段脚本，脚本用完后的任务直接成功。
pub(crate) struct MockTransport {
    events: Mutex<Option<Weak<dyn TransportEvents>>>,
    scripts: Mutex<VecDeque<Vec<Step>>>,
    created: Mutex<Vec<(RequestDescription, TaskKind)>>,
    tasks: Mutex<Vec<Weak<MockTask>>>,
    next_id: AtomicU64,
    invalidated: AtomicBool,
    workdir: TempDir,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<MockTransport> {
        Arc::new(MockTransport {
            events: Mutex::new(None),
            scripts: Mutex::new(VecDeque::new()),
            created: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(100),
            invalidated: AtomicBool::new(false),
            workdir: tempfile::tempdir().unwrap(),
        })
    }

    pub(crate) fn script(&self, steps: Vec<Step>) {
        self.scripts.lock().unwrap().push_back(steps);
    }

    pub(crate) fn created(&self) -> Vec<(RequestDescription, TaskKind)> {
        self.created.lock().unwrap().clone()
    }

    pub(crate) fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn register(&self, events: Weak<dyn TransportEvents>) {
        *self.events.lock().unwrap() = Some(events);
    }

    fn create_task(
        &self,
        request: &RequestDescription,
        kind: &TaskKind,
    ) -> Result<Arc<dyn TransportTask>, TransportError> {
        if self.is_invalidated() {
            return Err(TransportError::new(TransportErrorKind::Other, "会话已失效"));
        }
        let events = self
            .events
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| TransportError::new(TransportErrorKind::Other, "未注册回调接收端"))?;
        let steps = self.scripts.lock().unwrap().pop_front().unwrap_or_else(|| vec![Step::Succeed]);
        self.created.lock().unwrap().push((request.clone(), kind.clone()));

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (control, _) = watch::channel(Control::Suspended);
        let task = Arc::new_cyclic(|me| MockTask {
            me: me.clone(),
            id,
            url: request.url().clone(),
            kind: kind.clone(),
            steps,
            events,
            control,
            started: AtomicBool::new(false),
            workdir: self.workdir.path().to_path_buf(),
            runtime: Handle::current(),
        });
        self.tasks.lock().unwrap().push(Arc::downgrade(&task));
        Ok(task)
    }

    fn invalidate_and_cancel(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
        for task in self.tasks.lock().unwrap().drain(..) {
            if let Some(task) = task.upgrade() {
                task.cancel();
            }
        }
    }
}

pub(crate) struct MockTask {
    me: Weak<MockTask>,
    id: TaskId,
    url: Url,
    kind: TaskKind,
    steps: Vec<Step>,
    events: Weak<dyn TransportEvents>,
    control: watch::Sender<Control>,
    started: AtomicBool,
    workdir: std::path::PathBuf,
    runtime: Handle,
}

impl MockTask {
    fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(task) = self.me.upgrade() else { return };
        let control = self.control.subscribe();
        self.runtime.spawn(async move { task.drive(control).await });
    }

    fn is_download(&self) -> bool {
        matches!(self.kind, TaskKind::Download { .. })
    }

    fn partial(&self, body: &[u8]) -> ResumeData {
        let partial_path = self.workdir.join(format!("{}.partial", self.id));
        std::fs::write(&partial_path, body).unwrap();
        ResumeData {
            url: self.url.clone(),
            partial_path,
            bytes_received: body.len() as u64,
            validator: None,
        }
    }

    fn fail(&self, events: &dyn TransportEvents, error: TransportError, body: &[u8]) {
        let error = if self.is_download() { error.with_resume_data(self.partial(body)) } else { error };
        events.did_complete(self.id, Some(error));
    }

    async fn drive(self: Arc<Self>, mut control: watch::Receiver<Control>) {
        let mut body = BytesMut::new();
        if let TaskKind::Download { resume: Some(resume) } = &self.kind {
            if let Ok(existing) = std::fs::read(&resume.partial_path) {
                body.extend_from_slice(&existing);
            }
        }

        for step in self.steps.clone() {
            let running = match control.wait_for(|c| *c != Control::Suspended).await {
                Ok(state) => *state == Control::Running,
                Err(_) => false,
            };
            let Some(events) = self.events.upgrade() else { return };
            if !running {
                self.fail(events.as_ref(), TransportError::cancelled(), &body);
                return;
            }

            match step {
                Step::Response { status, content_length } => {
                    let mut head = response_head(status, content_length);
                    head.url = self.url.clone();
                    events.did_receive_response(self.id, head);
                }
                Step::Chunk(chunk) => {
                    body.extend_from_slice(&chunk);
                    events.did_receive_data(self.id, chunk);
                }
                Step::Fail(error) => {
                    self.fail(events.as_ref(), error, &body);
                    return;
                }
                Step::Succeed => {
                    self.succeed(events.as_ref(), &body);
                    return;
                }
                Step::Hang => {
                    drop(events);
                    let _ = control.wait_for(|c| *c == Control::Cancelled).await;
                    if let Some(events) = self.events.upgrade() {
                        self.fail(events.as_ref(), TransportError::cancelled(), &body);
                    }
                    return;
                }
            }
            drop(events);
            tokio::task::yield_now().await;
        }

        if let Some(events) = self.events.upgrade() {
            self.succeed(events.as_ref(), &body);
        }
    }

    fn succeed(&self, events: &dyn TransportEvents, body: &[u8]) {
        if self.is_download() {
            let location = self.workdir.join(format!("{}.tmp", uuid::Uuid::new_v4()));
            std::fs::write(&location, body).unwrap();
            events.did_finish_downloading(self.id, location);
        }
        events.did_complete(self.id, None);
    }
}

impl TransportTask for MockTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn resume(&self) {
        self.control.send_replace(Control::Running);
        self.start();
    }

    fn suspend(&self) {
        self.control.send_if_modified(|c| {
            if *c == Control::Running {
                *c = Control::Suspended;
                true
            } else {
                false
            }
        });
    }

    /// 未恢复过的任务被取消时也会投递完成回调
    fn cancel(&self) {
        self.control.send_replace(Control::Cancelled);
        self.start();
    }
}
