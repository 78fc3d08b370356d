use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::core::error::{Error, FetchResult};
use crate::core::task::DownloadOptions;

/// 配置结构体
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// 默认下载目录
    pub download_dir: String,
    /// 最大并发请求数
    pub max_concurrent_downloads: usize,
    /// 网络超时时间（秒），0 表示不限制
    pub timeout: u64,
    /// User-Agent，留空使用内置值
    pub user_agent: String,
    /// Accept-Language 使用的语言列表，留空时从环境变量推断
    pub accept_languages: Vec<String>,
    /// 创建请求后是否立即开始
    pub start_requests_immediately: bool,
    /// 最大重定向次数
    pub max_redirects: usize,
    /// 下载重试时是否断点续传
    pub enable_resume: bool,
    /// 重试次数
    pub retry_count: u32,
    /// 第一次重试前的等待（毫秒）
    pub retry_delay_ms: u64,
    /// 最大重试等待（毫秒）
    pub retry_max_delay_ms: u64,
    /// 重试等待的随机抖动比例
    pub retry_jitter: f64,
    /// 下载目标目录不存在时是否创建
    pub create_intermediate_directories: bool,
    /// 下载目标已存在时是否覆盖
    pub remove_previous_file: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: "./downloads".to_string(),
            max_concurrent_downloads: 3,
            timeout: 30,
            user_agent: String::new(),
            accept_languages: Vec::new(),
            start_requests_immediately: true,
            max_redirects: 10,
            enable_resume: true,
            retry_count: 3,
            retry_delay_ms: 1000,
            retry_max_delay_ms: 60_000,
            retry_jitter: 0.1,
            create_intermediate_directories: true,
            remove_previous_file: false,
        }
    }
}

impl Config {
    /// 加载配置文件，文件不存在时写入带教程的默认配置
    pub fn load(path: &str) -> FetchResult<Self> {
        if Path::new(path).exists() {
            let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
            match toml::from_str(&content) {
                Ok(config) => Ok(config),
                Err(e) => {
                    log::warn!("配置文件格式错误: {}，将使用默认配置", e);
                    Ok(Config::default())
                }
            }
        } else {
            let config = Config::default();
            config.save_with_tutorial(path)?;
            Ok(config)
        }
    }

    /// 保存带教程的配置文件（唯一写入方法）
    pub fn save_with_tutorial(&self, path: &str) -> FetchResult<()> {
        if let Some(parent) = Path::new(path).parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let config_content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("无法序列化配置: {}", e)))?;
        let full_content = format!("{}\n{}", Config::generate_tutorial_content(), config_content);
        fs::write(path, full_content).map_err(|e| Error::io(path, e))?;
        Ok(())
    }

    /// 教程部分全部是注释，配置项由序列化结果给出
    fn generate_tutorial_content() -> &'static str {
        r#"# minifetch 配置文件
# ====================
#
# 这是一个 TOML 格式的配置文件，用于配置 minifetch 的请求行为。
#
# 配置文件位置：
# - Windows: %APPDATA%/minifetch/minifetch.conf
# - macOS: ~/Library/Application Support/minifetch/minifetch.conf
# - Linux: ~/.config/minifetch/minifetch.conf
#
# 命令行参数会覆盖配置文件中的设置，优先级：命令行 > 配置文件 > 默认值
#
# 使用示例：
#   minifetch https://example.com/file.zip                        # 使用默认配置
#   minifetch -r 5 https://example.com/file.zip                   # 最多重试 5 次
#   minifetch -d /path/to/downloads https://example.com/file.zip  # 指定下载目录
#   minifetch -f urls.txt                                         # 从文件读取URL
#   minifetch -e                                                  # 编辑配置文件
#
# ==================== 配置项说明 ====================
#
# download_dir                    默认下载目录，支持相对路径和绝对路径
# max_concurrent_downloads        同时进行的请求数，建议 1-5
# timeout                         单次请求超时（秒），0 表示不限制
# user_agent                      留空使用内置的 minifetch/<版本>
# accept_languages                例如 ["zh-CN", "en"]，最多取前 6 个
# start_requests_immediately      为 false 时请求创建后需要手动开始
# max_redirects                   超过后请求以重定向错误失败
# enable_resume                   下载失败重试时从已下载的部分继续
# retry_count                     网络错误、5xx、408、429 时的重试次数
# retry_delay_ms                  第一次重试前的等待（毫秒），之后指数增长
# retry_max_delay_ms              重试等待的上限（毫秒）
# retry_jitter                    重试等待的随机抖动比例，0.1 表示 ±5%
# create_intermediate_directories 下载目录不存在时自动创建
# remove_previous_file            目标文件已存在时覆盖
#
# ==================== 故障排除 ====================
#
# 问题：经常下载失败
# 解决：增加 retry_count 或 timeout 值
#
# 问题：大文件下载中断
# 解决：确保 enable_resume = true
#
# 问题：提示目标文件已存在
# 解决：设置 remove_previous_file = true 或用 -n 指定新文件名
"#
    }

    /// 校验配置合法性
    pub fn validate(&self) -> FetchResult<()> {
        if self.max_concurrent_downloads == 0 {
            return Err(Error::Config("并发请求数必须大于0".to_string()));
        }

        if self.download_dir.is_empty() {
            return Err(Error::Config("下载目录不能为空".to_string()));
        }

        if self.retry_max_delay_ms < self.retry_delay_ms {
            return Err(Error::Config("最大重试延迟不能小于重试延迟".to_string()));
        }

        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(Error::Config("重试抖动比例必须在 0 到 1 之间".to_string()));
        }

        Ok(())
    }

    /// 合并命令行参数到配置
    pub fn merge_from_args(&mut self, args: &crate::cli::Args) {
        if let Some(dir) = &args.download_dir {
            self.download_dir = dir.clone();
        }

        if let Some(retries) = args.retries {
            self.retry_count = retries;
        }

        if let Some(timeout) = args.timeout {
            self.timeout = timeout;
        }

        if let Some(concurrency) = args.concurrency {
            self.max_concurrent_downloads = concurrency;
        }

        if args.no_resume {
            self.enable_resume = false;
        }

        if args.overwrite {
            self.remove_previous_file = true;
        }
    }

    /// 下载目标的处理方式
    pub fn download_options(&self) -> DownloadOptions {
        let mut options = DownloadOptions::NONE;
        if self.create_intermediate_directories {
            options = options | DownloadOptions::CREATE_INTERMEDIATE_DIRECTORIES;
        }
        if self.remove_previous_file {
            options = options | DownloadOptions::REMOVE_PREVIOUS_FILE;
        }
        options
    }

    /// 获取配置摘要信息
    pub fn get_summary(&self) -> String {
        format!(
            "配置摘要:\n\
            - 下载目录: {}\n\
            - 并发数: {}\n\
            - 超时时间: {}\n\
            - 最大重定向: {}\n\
            - 重试次数: {}\n\
            - 重试延迟: {} ms (最大 {} ms)\n\
            - 断点续传: {}\n\
            - 覆盖已有文件: {}",
            self.download_dir,
            self.max_concurrent_downloads,
            if self.timeout == 0 { "不限制".to_string() } else { format!("{} 秒", self.timeout) },
            self.max_redirects,
            self.retry_count,
            self.retry_delay_ms,
            self.retry_max_delay_ms,
            if self.enable_resume { "启用" } else { "禁用" },
            if self.remove_previous_file { "是" } else { "否" }
        )
    }
}
