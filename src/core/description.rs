use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use std::time::Duration;
use url::Url;

pub use http::{HeaderMap, Method};

use crate::core::encoding::{ParameterEncoding, Parameters};
use crate::core::error::{Error, FetchResult};

/// 声明式的请求描述
///
/// 构造后不可变：所有 `with_*` 方法都消耗自身并返回新的描述，适配器同样只产生新值。
/// 请求头使用 [`HeaderMap`]，键名大小写不敏感。
#[derive(Clone, Debug)]
pub struct RequestDescription {
    url: Url,
    method: Method,
    headers: HeaderMap,
    body: Option<Bytes>,
    timeout: Option<Duration>,
}

impl RequestDescription {
    /// 从字符串构造，URL 不合法时返回 [`Error::InvalidUrl`]
    pub fn new(method: Method, url: &str) -> FetchResult<Self> {
        let url = Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{} ({})", url, e)))?;
        if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
            return Err(Error::InvalidUrl(url.to_string()));
        }
        Ok(Self::from_url(method, url))
    }

    pub fn get(url: &str) -> FetchResult<Self> {
        Self::new(Method::GET, url)
    }

    pub fn from_url(method: Method, url: Url) -> Self {
        Self { url, method, headers: HeaderMap::new(), body: None, timeout: None }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// 传输层的单次请求超时，重试时不会被重新协商
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// 设置（覆盖）一个请求头
    pub fn header(self, name: &str, value: &str) -> FetchResult<Self> {
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| Error::InvalidHeader {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        let header_value = HeaderValue::from_str(value).map_err(|e| Error::InvalidHeader {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        Ok(self.with_header_value(header_name, header_value))
    }

    pub fn headers_from<'a, I>(self, headers: I) -> FetchResult<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        headers.into_iter().try_fold(self, |desc, (name, value)| desc.header(name, value))
    }

    pub fn with_header_value(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_url(mut self, url: Url) -> Self {
        self.url = url;
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// 去掉请求体及其 Content-Type / Content-Length
    pub fn without_body(mut self) -> Self {
        self.body = None;
        self.headers.remove(http::header::CONTENT_TYPE);
        self.headers.remove(http::header::CONTENT_LENGTH);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_parameters(
        self,
        parameters: &Parameters,
        encoding: ParameterEncoding,
    ) -> FetchResult<Self> {
        encoding.encode(self, parameters)
    }
}
