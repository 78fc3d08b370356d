use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::PathBuf;

use crate::core::description::RequestDescription;
use crate::core::error::{Error, FetchResult};
use crate::core::transport::{ResponseHead, ResumeData};

/// 最后一次尝试的时间信息
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timeline {
    pub start_time: Option<DateTime<Utc>>,
    pub initial_response_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

impl Timeline {
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// 数据请求完成后交给后续操作的结果
#[derive(Clone, Debug)]
pub struct DataResponse {
    /// 实际派发的（适配后的）请求
    pub request: Option<RequestDescription>,
    pub response: Option<ResponseHead>,
    /// 流式模式下为 None
    pub data: Option<Bytes>,
    pub error: Option<Error>,
    pub timeline: Timeline,
}

impl DataResponse {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> FetchResult<Bytes> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.data.unwrap_or_default()),
        }
    }
}

/// 下载请求完成后交给后续操作的结果
#[derive(Clone, Debug)]
pub struct DownloadResponse {
    pub request: Option<RequestDescription>,
    pub response: Option<ResponseHead>,
    pub temporary_path: Option<PathBuf>,
    pub destination_path: Option<PathBuf>,
    pub resume_data: Option<ResumeData>,
    pub error: Option<Error>,
    pub timeline: Timeline,
}

impl DownloadResponse {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// 成功时返回文件所在位置：有目标则为目标路径，否则为临时文件
    pub fn into_result(self) -> FetchResult<PathBuf> {
        if let Some(error) = self.error {
            return Err(error);
        }
        self.destination_path
            .or(self.temporary_path)
            .ok_or_else(|| {
                Error::io(
                    PathBuf::new(),
                    std::io::Error::new(std::io::ErrorKind::NotFound, "下载完成但没有文件位置"),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timeline_duration() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let timeline = Timeline {
            start_time: Some(start),
            end_time: Some(start + chrono::Duration::seconds(3)),
            ..Default::default()
        };
        assert_eq!(timeline.duration(), Some(chrono::Duration::seconds(3)));
        assert_eq!(Timeline::default().duration(), None);
    }

    #[test]
    fn test_download_result_prefers_destination() {
        let response = DownloadResponse {
            request: None,
            response: None,
            temporary_path: Some(PathBuf::from("/tmp/a.tmp")),
            destination_path: Some(PathBuf::from("/data/a.bin")),
            resume_data: None,
            error: None,
            timeline: Timeline::default(),
        };
        assert_eq!(response.into_result().unwrap(), PathBuf::from("/data/a.bin"));
    }
}
