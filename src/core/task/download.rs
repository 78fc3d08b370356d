use regex::Regex;
use std::fs;
use std::io;
use std::ops::BitOr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use crate::core::error::{ConflictReason, Error, FetchResult};
use crate::core::transport::{ResponseHead, ResumeData};

/// 移动下载文件之前执行的选项
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DownloadOptions {
    bits: u8,
}

impl DownloadOptions {
    pub const NONE: DownloadOptions = DownloadOptions { bits: 0 };
    /// 目标目录不存在时创建中间目录
    pub const CREATE_INTERMEDIATE_DIRECTORIES: DownloadOptions = DownloadOptions { bits: 1 << 0 };
    /// 目标位置已有文件时先删除
    pub const REMOVE_PREVIOUS_FILE: DownloadOptions = DownloadOptions { bits: 1 << 1 };

    pub fn contains(self, other: DownloadOptions) -> bool {
        self.bits & other.bits == other.bits
    }
}

impl BitOr for DownloadOptions {
    type Output = DownloadOptions;

    fn bitor(self, rhs: Self) -> Self::Output {
        DownloadOptions { bits: self.bits | rhs.bits }
    }
}

/// 根据临时文件和响应决定最终位置
pub type DownloadDestination =
    Arc<dyn Fn(&Path, Option<&ResponseHead>) -> (PathBuf, DownloadOptions) + Send + Sync>;

/// 固定的目标路径
pub fn fixed_destination(path: impl Into<PathBuf>, options: DownloadOptions) -> DownloadDestination {
    let path = path.into();
    Arc::new(move |_, _| (path.clone(), options))
}

/// 保存到目录下，文件名取自 Content-Disposition 或 URL 路径
pub fn suggested_destination(dir: impl Into<PathBuf>, options: DownloadOptions) -> DownloadDestination {
    let dir = dir.into();
    Arc::new(move |temporary, response| {
        let name = response
            .and_then(suggested_filename)
            .or_else(|| temporary.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "download".to_string());
        (dir.join(name), options)
    })
}

fn content_disposition_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?i)filename\*?\s*=\s*(?:UTF-8'')?"?([^";]+)"?"#).expect("静态正则表达式")
    })
}

/// 从响应推断文件名，只取最后一个路径分量
pub fn suggested_filename(response: &ResponseHead) -> Option<String> {
    let from_header = response
        .headers
        .get(http::header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| content_disposition_pattern().captures(v))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string());

    let from_url = response
        .url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    from_header
        .or(from_url)
        .and_then(|name| Path::new(&name).file_name().map(|n| n.to_string_lossy().into_owned()))
        .filter(|n| n != "." && n != "..")
}

/// 下载任务的状态
#[derive(Default)]
pub struct DownloadDelegate {
    destination: Option<DownloadDestination>,
    temporary_path: Option<PathBuf>,
    destination_path: Option<PathBuf>,
    resume_data: Option<ResumeData>,
}

impl DownloadDelegate {
    pub(crate) fn new(destination: Option<DownloadDestination>) -> Self {
        Self { destination, ..Default::default() }
    }

    pub fn temporary_path(&self) -> Option<&Path> {
        self.temporary_path.as_deref()
    }

    pub fn destination_path(&self) -> Option<&Path> {
        self.destination_path.as_deref()
    }

    pub fn resume_data(&self) -> Option<&ResumeData> {
        self.resume_data.as_ref()
    }

    pub(crate) fn destination(&self) -> Option<DownloadDestination> {
        self.destination.clone()
    }

    pub(crate) fn did_finish_downloading(&mut self, location: PathBuf) {
        self.temporary_path = Some(location);
    }

    pub(crate) fn did_move(&mut self, destination: PathBuf) {
        self.destination_path = Some(destination);
    }

    pub(crate) fn set_resume_data(&mut self, resume_data: ResumeData) {
        self.resume_data = Some(resume_data);
    }

    pub(crate) fn reset(&mut self) {
        self.temporary_path = None;
        self.destination_path = None;
        self.resume_data = None;
    }
}

/// 把临时文件移动到目标位置
///
/// 要么目标文件完整出现，要么目标位置保持原状。数据先落到目标目录下的暂存文件，
/// 不覆盖时用硬链接提交（目标已存在则失败），覆盖时用 rename 原子替换。
pub fn move_to_destination(
    temporary: &Path,
    destination: &Path,
    options: DownloadOptions,
) -> FetchResult<()> {
    let parent = match destination.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    if !parent.is_dir() {
        if !options.contains(DownloadOptions::CREATE_INTERMEDIATE_DIRECTORIES) {
            return Err(Error::DestinationConflict {
                path: destination.to_path_buf(),
                reason: ConflictReason::MissingDirectory,
            });
        }
        fs::create_dir_all(&parent).map_err(|e| Error::io(&parent, e))?;
    }

    let replace = options.contains(DownloadOptions::REMOVE_PREVIOUS_FILE);
    if destination.exists() && !replace {
        return Err(Error::DestinationConflict {
            path: destination.to_path_buf(),
            reason: ConflictReason::FileExists,
        });
    }

    let staged = parent.join(format!(".{}.minifetch.part", uuid::Uuid::new_v4()));
    stage(temporary, &staged)?;

    let committed = if replace {
        fs::rename(&staged, destination).map_err(|e| Error::io(destination, e))
    } else {
        commit_no_clobber(&staged, destination)
    };
    if committed.is_err() {
        // 数据退回临时位置，仍可通过 temporary_path 取到
        if let Err(e) = stage(&staged, temporary) {
            log::warn!("暂存文件 {:?} 无法退回 {:?}: {}", staged, temporary, e);
        }
    }
    committed
}

/// 先尝试 rename，跨文件系统时退化为复制
fn stage(temporary: &Path, staged: &Path) -> FetchResult<()> {
    if fs::rename(temporary, staged).is_ok() {
        return Ok(());
    }
    if let Err(e) = fs::copy(temporary, staged) {
        let _ = fs::remove_file(staged);
        return Err(Error::io(temporary, e));
    }
    let _ = fs::remove_file(temporary);
    Ok(())
}

fn commit_no_clobber(staged: &Path, destination: &Path) -> FetchResult<()> {
    match fs::hard_link(staged, destination) {
        Ok(()) => {
            let _ = fs::remove_file(staged);
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(Error::DestinationConflict {
            path: destination.to_path_buf(),
            reason: ConflictReason::FileExists,
        }),
        Err(_) => {
            // 文件系统不支持硬链接
            if destination.exists() {
                return Err(Error::DestinationConflict {
                    path: destination.to_path_buf(),
                    reason: ConflictReason::FileExists,
                });
            }
            fs::rename(staged, destination).map_err(|e| Error::io(destination, e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, StatusCode};
    use tempfile::tempdir;
    use url::Url;

    fn write_temp(dir: &Path, content: &[u8]) -> PathBuf {
        let path = dir.join("download.tmp");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_move_into_existing_directory() {
        let dir = tempdir().unwrap();
        let temp = write_temp(dir.path(), b"payload");
        let dest = dir.path().join("out.bin");

        move_to_destination(&temp, &dest, DownloadOptions::NONE).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"payload");
        assert!(!temp.exists());
    }

    #[test]
    fn test_missing_directory_without_option_conflicts() {
        let dir = tempdir().unwrap();
        let temp = write_temp(dir.path(), b"payload");
        let dest = dir.path().join("a/b/out.bin");

        let err = move_to_destination(&temp, &dest, DownloadOptions::NONE).unwrap_err();
        assert!(matches!(
            err,
            Error::DestinationConflict { reason: ConflictReason::MissingDirectory, .. }
        ));
        assert!(temp.exists());

        move_to_destination(&temp, &dest, DownloadOptions::CREATE_INTERMEDIATE_DIRECTORIES).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"payload");
    }

    #[test]
    fn test_existing_file_left_untouched_on_conflict() {
        let dir = tempdir().unwrap();
        let temp = write_temp(dir.path(), b"new content");
        let dest = dir.path().join("out.bin");
        fs::write(&dest, b"old").unwrap();

        let err = move_to_destination(&temp, &dest, DownloadOptions::NONE).unwrap_err();
        assert!(matches!(err, Error::DestinationConflict { reason: ConflictReason::FileExists, .. }));
        assert_eq!(fs::read(&dest).unwrap(), b"old");
        // 目标目录里不残留暂存文件
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_failed_commit_restores_temporary_file() {
        let dir = tempdir().unwrap();
        let temp = write_temp(dir.path(), b"downloaded bytes");
        // 非空目录无法被 rename 覆盖
        let dest = dir.path().join("out.bin");
        fs::create_dir(&dest).unwrap();
        fs::write(dest.join("inner"), b"x").unwrap();

        let err = move_to_destination(&temp, &dest, DownloadOptions::REMOVE_PREVIOUS_FILE).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        assert_eq!(fs::read(&temp).unwrap(), b"downloaded bytes");
        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_remove_previous_file_replaces() {
        let dir = tempdir().unwrap();
        let temp = write_temp(dir.path(), b"new content");
        let dest = dir.path().join("out.bin");
        fs::write(&dest, b"old").unwrap();

        let options = DownloadOptions::REMOVE_PREVIOUS_FILE | DownloadOptions::CREATE_INTERMEDIATE_DIRECTORIES;
        assert!(options.contains(DownloadOptions::REMOVE_PREVIOUS_FILE));
        move_to_destination(&temp, &dest, options).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"new content");
    }

    #[test]
    fn test_suggested_filename() {
        let url = Url::parse("https://example.com/files/report.pdf?x=1").unwrap();
        let head = ResponseHead::new(url.clone(), StatusCode::OK, HeaderMap::new());
        assert_eq!(suggested_filename(&head).as_deref(), Some("report.pdf"));

        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_DISPOSITION,
            "attachment; filename=\"../../etc/passwd\"".parse().unwrap(),
        );
        let head = ResponseHead::new(url.clone(), StatusCode::OK, headers);
        assert_eq!(suggested_filename(&head).as_deref(), Some("passwd"));

        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_DISPOSITION,
            "attachment; filename*=UTF-8''data.csv".parse().unwrap(),
        );
        let head = ResponseHead::new(url, StatusCode::OK, headers);
        assert_eq!(suggested_filename(&head).as_deref(), Some("data.csv"));
    }
}
