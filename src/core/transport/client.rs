//! 基于 reqwest 的传输层实现
//!
//! 每个任务在第一次恢复（或取消）时启动一个 tokio 任务，控制信号通过 watch 通道传递：
//! 暂停在数据块之间生效，取消会打断正在等待的网络操作。重定向由这里逐跳处理，
//! 每一跳都询问回调接收端。

use bytes::Bytes;
use futures::StreamExt;
use http::header::{
    HeaderValue, ACCEPT_ENCODING, ACCEPT_LANGUAGE, ETAG, IF_RANGE, LAST_MODIFIED,
    LOCATION, RANGE, USER_AGENT, WWW_AUTHENTICATE,
};
use http::{HeaderMap, Method, StatusCode};
use regex::Regex;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::sync::watch;

use super::{
    AuthChallenge, ChallengeDisposition, Credential, ResponseHead, ResumeData, TaskId, TaskKind,
    Transport, TransportError, TransportErrorKind, TransportEvents, TransportTask,
};
use crate::config::Config;
use crate::core::description::RequestDescription;
use crate::core::error::{Error, FetchResult};

/// 同一个任务最多接受的凭据次数
const MAX_CHALLENGE_ATTEMPTS: u32 = 3;

/// 会话级默认请求头：Accept-Encoding、Accept-Language、User-Agent
pub fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip;q=1.0, compress;q=0.5"));
    if let Ok(value) = HeaderValue::from_str(&accept_language(&preferred_languages())) {
        headers.insert(ACCEPT_LANGUAGE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&user_agent()) {
        headers.insert(USER_AGENT, value);
    }
    headers
}

/// 最多取前六种语言，q 值从 1.0 依次递减 0.1
pub fn accept_language(languages: &[String]) -> String {
    languages
        .iter()
        .take(6)
        .enumerate()
        .map(|(index, language)| format!("{};q={:.1}", language, 1.0 - index as f64 * 0.1))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `名称/版本 (系统; 架构)`
pub fn user_agent() -> String {
    format!(
        "{}/{} ({}; {})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// 从 LANGUAGE / LANG 推断首选语言，`zh_CN.UTF-8` 记为 `zh-CN`
fn preferred_languages() -> Vec<String> {
    let raw = std::env::var("LANGUAGE")
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(|| std::env::var("LANG").ok())
        .unwrap_or_default();
    let languages: Vec<String> = raw
        .split(':')
        .map(|entry| entry.split('.').next().unwrap_or_default().replace('_', "-"))
        .filter(|language| !language.is_empty() && language != "C" && language != "POSIX")
        .collect();
    if languages.is_empty() {
        vec!["en".to_string()]
    } else {
        languages
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Control {
    Suspended,
    Running,
    Cancelled,
}

struct TransportInner {
    client: reqwest::Client,
    session_headers: HeaderMap,
    max_redirects: usize,
    temp_dir: PathBuf,
    runtime: Handle,
    events: Mutex<Option<Weak<dyn TransportEvents>>>,
    tasks: Mutex<HashMap<TaskId, Weak<HttpTask>>>,
    next_id: AtomicU64,
    invalidated: AtomicBool,
}

impl TransportInner {
    fn events(&self) -> Option<Arc<dyn TransportEvents>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<TaskId, Weak<HttpTask>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// HTTP 传输层
pub struct HttpTransport {
    inner: Arc<TransportInner>,
}

impl HttpTransport {
    /// 使用默认请求头、最多 10 次重定向
    pub fn new() -> FetchResult<Self> {
        Self::with_options(None, default_headers(), 10, std::env::temp_dir().join("minifetch"))
    }

    pub fn from_config(config: &Config) -> FetchResult<Self> {
        let mut headers = default_headers();
        if !config.user_agent.is_empty() {
            let value = HeaderValue::from_str(&config.user_agent).map_err(|e| Error::InvalidHeader {
                name: USER_AGENT.to_string(),
                reason: e.to_string(),
            })?;
            headers.insert(USER_AGENT, value);
        }
        if !config.accept_languages.is_empty() {
            let value = HeaderValue::from_str(&accept_language(&config.accept_languages)).map_err(|e| {
                Error::InvalidHeader { name: ACCEPT_LANGUAGE.to_string(), reason: e.to_string() }
            })?;
            headers.insert(ACCEPT_LANGUAGE, value);
        }
        let timeout = (config.timeout > 0).then(|| Duration::from_secs(config.timeout));
        Self::with_options(timeout, headers, config.max_redirects, std::env::temp_dir().join("minifetch"))
    }

    /// `timeout` 为整个请求的超时；请求描述里的超时优先
    pub fn with_options(
        timeout: Option<Duration>,
        mut session_headers: HeaderMap,
        max_redirects: usize,
        temp_dir: PathBuf,
    ) -> FetchResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|_| Error::Config("HttpTransport 必须在 tokio 运行时中创建".to_string()))?;

        // 内容编码由 reqwest 协商并解压
        session_headers.remove(ACCEPT_ENCODING);

        let mut builder = reqwest::Client::builder().redirect(reqwest::redirect::Policy::none());
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().map_err(|e| Error::Config(format!("无法创建 HTTP 客户端: {}", e)))?;

        Ok(Self {
            inner: Arc::new(TransportInner {
                client,
                session_headers,
                max_redirects,
                temp_dir,
                runtime,
                events: Mutex::new(None),
                tasks: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                invalidated: AtomicBool::new(false),
            }),
        })
    }

    /// 当前未结束的任务数
    pub fn active_tasks(&self) -> usize {
        self.inner.tasks().values().filter(|t| t.strong_count() > 0).count()
    }
}

impl Transport for HttpTransport {
    fn register(&self, events: Weak<dyn TransportEvents>) {
        *self.inner.events.lock().unwrap_or_else(PoisonError::into_inner) = Some(events);
    }

    fn create_task(
        &self,
        request: &RequestDescription,
        kind: &TaskKind,
    ) -> Result<Arc<dyn TransportTask>, TransportError> {
        if self.inner.invalidated.load(Ordering::SeqCst) {
            return Err(TransportError::new(TransportErrorKind::Other, "会话已失效"));
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (control, _) = watch::channel(Control::Suspended);
        let task = Arc::new_cyclic(|me| HttpTask {
            me: me.clone(),
            id,
            request: request.clone(),
            kind: kind.clone(),
            control,
            started: AtomicBool::new(false),
            inner: self.inner.clone(),
        });
        self.inner.tasks().insert(id, Arc::downgrade(&task));
        Ok(task)
    }

    fn invalidate_and_cancel(&self) {
        self.inner.invalidated.store(true, Ordering::SeqCst);
        let tasks: Vec<_> = self.inner.tasks().drain().filter_map(|(_, t)| t.upgrade()).collect();
        for task in tasks {
            task.cancel();
        }
    }
}

struct HttpTask {
    me: Weak<HttpTask>,
    id: TaskId,
    request: RequestDescription,
    kind: TaskKind,
    control: watch::Sender<Control>,
    started: AtomicBool,
    inner: Arc<TransportInner>,
}

impl TransportTask for HttpTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn resume(&self) {
        self.control.send_if_modified(|c| {
            if *c == Control::Suspended {
                *c = Control::Running;
                true
            } else {
                false
            }
        });
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

    /// 未恢复过的任务被取消时同样会投递完成回调
    fn cancel(&self) {
        self.control.send_replace(Control::Cancelled);
        self.start();
    }
}

/// 等到任务可以继续执行；被取消时返回错误
async fn runnable(control: &mut watch::Receiver<Control>) -> Result<(), TransportError> {
    match control.wait_for(|c| *c != Control::Suspended).await {
        Ok(state) if *state == Control::Running => Ok(()),
        _ => Err(TransportError::cancelled()),
    }
}

/// 在等待网络操作的同时监听取消
async fn cancellable<T>(
    control: &mut watch::Receiver<Control>,
    operation: impl Future<Output = T>,
) -> Result<T, TransportError> {
    tokio::select! {
        value = operation => Ok(value),
        _ = control.wait_for(|c| *c == Control::Cancelled) => Err(TransportError::cancelled()),
    }
}

fn error_text(error: &(dyn std::error::Error + 'static)) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

fn classify(error: &reqwest::Error) -> TransportError {
    let text = error_text(error);
    let lower = text.to_ascii_lowercase();
    let kind = if error.is_timeout() {
        TransportErrorKind::Timeout
    } else if error.is_connect() {
        if lower.contains("dns") || lower.contains("failed to lookup address") || lower.contains("name or service not known") {
            TransportErrorKind::Dns
        } else if lower.contains("tls") || lower.contains("certificate") || lower.contains("handshake") {
            TransportErrorKind::Tls
        } else {
            TransportErrorKind::Connect
        }
    } else if error.is_redirect() {
        TransportErrorKind::Redirect
    } else if lower.contains("connection reset") || lower.contains("broken pipe") {
        TransportErrorKind::Reset
    } else if error.is_body() || error.is_decode() || lower.contains("unexpected eof") {
        TransportErrorKind::Read
    } else {
        TransportErrorKind::Other
    };
    TransportError::new(kind, text)
}

fn io_error(path: &Path, error: std::io::Error) -> TransportError {
    TransportError::new(TransportErrorKind::Other, format!("写入 {:?} 失败: {}", path, error))
}

fn realm_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"(?i)realm\s*=\s*"?([^",]*)"?"#).expect("静态正则表达式"))
}

fn head_of(response: &reqwest::Response) -> ResponseHead {
    ResponseHead::new(response.url().clone(), response.status(), response.headers().clone())
}

/// 下载完成后交给回调接收端的结果
enum Finished {
    Data,
    Download(PathBuf),
}

impl HttpTask {
    fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(task) = self.me.upgrade() else { return };
        let control = self.control.subscribe();
        self.inner.runtime.spawn(async move { task.run(control).await });
    }

    fn events(&self) -> Result<Arc<dyn TransportEvents>, TransportError> {
        self.inner.events().ok_or_else(TransportError::cancelled)
    }

    async fn run(self: Arc<Self>, mut control: watch::Receiver<Control>) {
        let result = self.execute(&mut control).await;
        self.inner.tasks().remove(&self.id);

        let Some(events) = self.inner.events() else {
            log::debug!("任务 {} 结束时回调接收端已释放", self.id);
            return;
        };
        match result {
            Ok(Finished::Data) => events.did_complete(self.id, None),
            Ok(Finished::Download(path)) => {
                events.did_finish_downloading(self.id, path);
                events.did_complete(self.id, None);
            }
            Err(error) => {
                log::debug!("任务 {} 失败: {}", self.id, error);
                events.did_complete(self.id, Some(error));
            }
        }
    }

    fn build(
        &self,
        request: &RequestDescription,
        credential: Option<&Credential>,
        resume: Option<&ResumeData>,
    ) -> reqwest::RequestBuilder {
        let mut headers = self.inner.session_headers.clone();
        for name in request.headers().keys() {
            headers.remove(name);
        }
        headers.extend(request.headers().clone());

        let mut builder = self
            .inner
            .client
            .request(request.method().clone(), request.url().clone())
            .headers(headers);
        if let Some(body) = request.body() {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = request.timeout() {
            builder = builder.timeout(timeout);
        }
        if let Some(credential) = credential {
            builder = builder.basic_auth(&credential.user, Some(&credential.password));
        }
        if let Some(resume) = resume {
            builder = builder.header(RANGE, format!("bytes={}-", resume.bytes_received));
            if let Some(validator) = &resume.validator {
                builder = builder.header(IF_RANGE, validator.as_str());
            }
        }
        builder
    }

    /// 3xx 且带 Location 时给出下一跳的请求描述
    fn redirect_target(&self, current: &RequestDescription, head: &ResponseHead) -> Option<RequestDescription> {
        if !head.status.is_redirection() {
            return None;
        }
        let location = head.headers.get(LOCATION)?.to_str().ok()?;
        let url = head.url.join(location).ok()?;
        let next = current.clone().with_url(url);
        // 303 以及 POST 上的 301/302 改为不带请求体的 GET
        let to_get = head.status == StatusCode::SEE_OTHER
            || (matches!(head.status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND)
                && current.method() == Method::POST);
        if to_get {
            return Some(next.with_method(Method::GET).without_body());
        }
        Some(next)
    }

    fn challenge(&self, head: &ResponseHead, failures: u32) -> Option<AuthChallenge> {
        let scheme = head.headers.get(WWW_AUTHENTICATE)?.to_str().ok()?.to_string();
        let realm = realm_pattern()
            .captures(&scheme)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());
        Some(AuthChallenge { url: head.url.clone(), scheme, realm, previous_failure_count: failures })
    }

    /// 续传状态与磁盘上的部分文件一致时才发送 Range
    async fn resume_point(&self) -> Option<ResumeData> {
        let TaskKind::Download { resume: Some(resume) } = &self.kind else { return None };
        match tokio::fs::metadata(&resume.partial_path).await {
            Ok(meta) if meta.len() == resume.bytes_received && resume.bytes_received > 0 => Some(resume.clone()),
            _ => {
                log::debug!("任务 {} 的续传文件不可用，从头下载", self.id);
                None
            }
        }
    }

    async fn execute(&self, control: &mut watch::Receiver<Control>) -> Result<Finished, TransportError> {
        let resume = self.resume_point().await;
        let mut request = self.request.clone();
        let mut redirects = 0usize;
        let mut failures = 0u32;
        let mut credential: Option<Credential> = None;

        let response = loop {
            runnable(control).await?;
            let builder = self.build(&request, credential.as_ref(), resume.as_ref());
            let response = cancellable(control, builder.send()).await?.map_err(|e| classify(&e))?;
            let head = head_of(&response);

            if let Some(next) = self.redirect_target(&request, &head) {
                if redirects >= self.inner.max_redirects {
                    return Err(TransportError::new(
                        TransportErrorKind::Redirect,
                        format!("超过最大重定向次数 {}", self.inner.max_redirects),
                    ));
                }
                match self.events()?.will_perform_redirection(self.id, &head, next) {
                    Some(next) => {
                        redirects += 1;
                        request = next;
                        continue;
                    }
                    // 拒绝跟随时 3xx 响应就是最终响应
                    None => break response,
                }
            }

            if head.status == StatusCode::UNAUTHORIZED && failures < MAX_CHALLENGE_ATTEMPTS {
                if let Some(challenge) = self.challenge(&head, failures) {
                    match self.events()?.did_receive_challenge(self.id, &challenge) {
                        (ChallengeDisposition::UseCredential, Some(next)) => {
                            failures += 1;
                            credential = Some(next);
                            continue;
                        }
                        (ChallengeDisposition::CancelAuthenticationChallenge, _) => {
                            return Err(TransportError::cancelled());
                        }
                        _ => {}
                    }
                }
            }
            break response;
        };

        let head = head_of(&response);
        self.events()?.did_receive_response(self.id, head.clone());

        match &self.kind {
            TaskKind::Data => {
                self.stream_data(control, response).await?;
                let cacheable = request.method() == Method::GET && head.status.is_success();
                if cacheable && !self.events()?.will_cache_response(self.id, &head) {
                    log::debug!("任务 {} 的响应不缓存", self.id);
                }
                Ok(Finished::Data)
            }
            TaskKind::Download { .. } => {
                let path = self.stream_download(control, response, &head, resume).await?;
                Ok(Finished::Download(path))
            }
        }
    }

    async fn stream_data(
        &self,
        control: &mut watch::Receiver<Control>,
        response: reqwest::Response,
    ) -> Result<(), TransportError> {
        let mut body = response.bytes_stream();
        loop {
            runnable(control).await?;
            match cancellable(control, body.next()).await? {
                Some(Ok(chunk)) => self.events()?.did_receive_data(self.id, chunk),
                Some(Err(e)) => return Err(classify(&e)),
                None => return Ok(()),
            }
        }
    }

    async fn stream_download(
        &self,
        control: &mut watch::Receiver<Control>,
        response: reqwest::Response,
        head: &ResponseHead,
        resume: Option<ResumeData>,
    ) -> Result<PathBuf, TransportError> {
        // 服务器忽略 Range 时从头写
        let append = resume.is_some() && head.status == StatusCode::PARTIAL_CONTENT;
        let (path, mut written) = match resume {
            Some(resume) if append => (resume.partial_path, resume.bytes_received),
            _ => (self.inner.temp_dir.join(format!("{}.tmp", uuid::Uuid::new_v4())), 0),
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| io_error(parent, e))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&path)
            .await
            .map_err(|e| io_error(&path, e))?;

        let validator = head
            .headers
            .get(ETAG)
            .or_else(|| head.headers.get(LAST_MODIFIED))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut body = response.bytes_stream();
        loop {
            let next = match runnable(control).await {
                Ok(()) => cancellable(control, body.next()).await,
                Err(error) => Err(error),
            };
            let chunk: Bytes = match next {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(self.partial(&mut file, &path, written, validator, classify(&e)).await),
                Err(error) => return Err(self.partial(&mut file, &path, written, validator, error).await),
            };
            if let Err(e) = file.write_all(&chunk).await {
                return Err(self.partial(&mut file, &path, written, validator, io_error(&path, e)).await);
            }
            written += chunk.len() as u64;
            self.events()?.did_receive_data(self.id, chunk);
        }
        file.flush().await.map_err(|e| io_error(&path, e))?;
        Ok(path)
    }

    /// 失败的下载：有数据时附上续传状态，否则删掉空文件
    async fn partial(
        &self,
        file: &mut tokio::fs::File,
        path: &Path,
        written: u64,
        validator: Option<String>,
        error: TransportError,
    ) -> TransportError {
        let _ = file.flush().await;
        if written == 0 {
            let _ = tokio::fs::remove_file(path).await;
            return error;
        }
        error.with_resume_data(ResumeData {
            url: self.request.url().clone(),
            partial_path: path.to_path_buf(),
            bytes_received: written,
            validator,
        })
    }
}
