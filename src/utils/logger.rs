use chrono::Local; // 用于获取本地时间
use log::{LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// 默认轮转阈值：10MB
pub const DEFAULT_MAX_SIZE: u64 = 10 * 1024 * 1024;

struct LogFile {
    writer: BufWriter<File>,
    current_size: u64,
}

/// 写入文件的日志实现，超过大小后轮转到 `<file>.backup`
pub struct FileLogger {
    file: Mutex<LogFile>,
    level: LevelFilter,
    file_path: PathBuf,
    max_size: u64, // 最大文件大小 (bytes)
}

impl FileLogger {
    pub fn new(file_path: impl AsRef<Path>, level: LevelFilter, max_size: u64) -> Result<Self, std::io::Error> {
        let file_path = file_path.as_ref().to_path_buf();
        // 确保日志目录存在
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&file_path)?;
        let current_size = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            file: Mutex::new(LogFile { writer: BufWriter::new(file), current_size }),
            level,
            file_path,
            max_size,
        })
    }

    /// 安装为全局日志实现
    pub fn init(self) -> Result<(), log::SetLoggerError> {
        let level = self.level;
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(level);
        Ok(())
    }

    /// 检查并执行日志轮转
    fn check_rotation(&self, file: &mut LogFile) -> Result<(), std::io::Error> {
        if file.current_size > self.max_size {
            file.writer.flush()?;

            let backup_path = self.backup_path();
            if backup_path.exists() {
                std::fs::remove_file(&backup_path)?;
            }
            std::fs::rename(&self.file_path, &backup_path)?;

            let new_file = OpenOptions::new().create(true).append(true).open(&self.file_path)?;
            file.writer = BufWriter::new(new_file);
            file.current_size = 0;
        }
        Ok(())
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self.file_path.as_os_str().to_os_string();
        name.push(".backup");
        PathBuf::from(name)
    }

    fn write_entry(&self, record: &Record<'_>) -> Result<(), std::io::Error> {
        let entry = format!(
            "{} [{}] {} - {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            record.level(),
            record.target(),
            record.args()
        );

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        self.check_rotation(&mut file)?;
        file.writer.write_all(entry.as_bytes())?;
        file.current_size += entry.len() as u64;

        // 警告及以上立即落盘
        if record.level() <= log::Level::Warn {
            file.writer.flush()?;
        }
        Ok(())
    }
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Err(e) = self.write_entry(record) {
            eprintln!("日志写入失败: {}", e);
        }
    }

    fn flush(&self) {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = file.writer.flush();
    }
}
