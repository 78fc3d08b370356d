//! CLI: 命令行接口和参数解析模块
//!
//! ## 支持的命令
//!
//! - 基本下载：`minifetch <url>`
//! - 批量下载：`minifetch -f urls.txt`
//! - 编辑配置：`minifetch -e`
//! - 指定配置：`minifetch -c config.conf <url>`
//! - 重试次数：`minifetch -r 5 <url>`
//!
//! ## 平台支持
//!
//! - Windows: `%APPDATA%/minifetch/minifetch.conf`
//! - macOS: `~/Library/Application Support/minifetch/minifetch.conf`
//! - Linux: `~/.config/minifetch/minifetch.conf`

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::env;
use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::utils::validator;

/// 获取平台默认配置文件路径
pub fn default_config_path() -> String {
    #[cfg(target_os = "windows")]
    {
        let appdata = env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        format!("{}/minifetch/minifetch.conf", appdata)
    }
    #[cfg(target_os = "macos")]
    {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{}/Library/Application Support/minifetch/minifetch.conf", home)
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{}/.config/minifetch/minifetch.conf", home)
    }
}

/// 打开配置文件编辑器
pub fn open_config_in_editor(config_path: &str) {
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("notepad").arg(config_path).status().ok();
    }
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg("-e").arg(config_path).status().ok();
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        // 优先 $EDITOR，其次 xdg-open，最后 nano
        let editor = env::var("EDITOR").ok();
        let opened = match editor {
            Some(editor) => std::process::Command::new(editor).arg(config_path).status().is_ok(),
            None => std::process::Command::new("xdg-open").arg(config_path).status().is_ok(),
        };
        if !opened {
            let _ = std::process::Command::new("nano").arg(config_path).status();
        }
    }
}

/// minifetch 命令行参数
///
/// 示例用法：
///   minifetch https://example.com/file.zip
///   minifetch -e  # 编辑配置文件
///   minifetch -c /path/to/config.conf https://example.com/file.zip
#[derive(Parser, Debug, Clone)]
#[command(
    name = "minifetch",
    version = env!("CARGO_PKG_VERSION"),
    about = "可重试、可续传的 HTTP 下载工具",
    long_about = "基于 minifetch 请求引擎的下载工具：失败自动按指数退避重试，下载中断后从已下载的部分继续。\n\n示例：\n  minifetch https://example.com/file.zip\n  minifetch -f urls.txt -d ./downloads\n  minifetch -r 5 --timeout 60 https://example.com/big.iso\n"
)]
pub struct Args {
    /// 要下载的URL列表（可同时指定多个）
    #[arg(required = false, help = "要下载的URL列表，可以同时指定多个URL。")]
    pub urls: Vec<String>,

    /// 包含URL列表的文件路径
    #[arg(short, long, help = "包含URL列表的文件路径，每行一个URL，# 开头为注释。")]
    pub file: Option<String>,

    /// 配置文件路径，默认为平台推荐路径
    #[arg(short = 'c', long, default_value_t = default_config_path(), help = "配置文件路径，默认为平台推荐路径。")]
    pub config: String,

    /// 编辑配置文件（-e 或 --edit）
    #[arg(short = 'e', long = "edit", help = "用系统默认编辑器打开配置文件并退出。")]
    pub edit_config: bool,

    /// 指定下载目录
    #[arg(long, short = 'd', help = "指定下载目录，覆盖配置文件中的设置。")]
    pub download_dir: Option<String>,

    /// 指定下载文件名（仅单个URL时有效）
    #[arg(long, short = 'n', help = "指定下载文件名，覆盖响应头和URL推断。")]
    pub file_name: Option<String>,

    #[arg(long, short = 'r', help = "失败后的最大重试次数。")]
    pub retries: Option<u32>,

    #[arg(long, help = "单次请求超时（秒），0 表示不限制。")]
    pub timeout: Option<u64>,

    #[arg(long, short = 'j', help = "同时进行的下载数。")]
    pub concurrency: Option<usize>,

    #[arg(long, help = "重试时不从已下载的部分继续。")]
    pub no_resume: bool,

    #[arg(long, help = "目标文件已存在时覆盖。")]
    pub overwrite: bool,

    /// 写入日志文件而不是标准错误
    #[arg(long, help = "把日志写入指定文件（超过 10MB 时轮转）。")]
    pub log_file: Option<String>,

    #[arg(short, long, help = "输出调试日志。")]
    pub verbose: bool,
}

impl Args {
    /// 解析命令行参数，加载（或创建）配置文件并合并
    pub fn parse_args() -> Result<(Self, Config)> {
        let args = Args::parse();

        if args.edit_config {
            // 先确保文件存在，编辑器打开的才是带教程的配置
            Config::load(&args.config).with_context(|| format!("无法创建配置文件 {}", args.config))?;
            open_config_in_editor(&args.config);
            std::process::exit(0);
        }

        let config = args.load_config()?;
        Ok((args, config))
    }

    pub fn load_config(&self) -> Result<Config> {
        let mut config = Config::load(&self.config).with_context(|| format!("无法读取配置文件 {}", self.config))?;
        config.merge_from_args(self);
        validator::validate_config(&config)?;
        Ok(config)
    }

    /// 合并命令行与文件中的URL
    pub fn get_urls(&self) -> Result<Vec<String>> {
        let mut urls = Vec::new();
        urls.extend_from_slice(&self.urls);

        if let Some(file_path) = &self.file {
            if !Path::new(file_path).exists() {
                bail!("URL文件不存在: {}", file_path);
            }
            let content = fs::read_to_string(file_path).with_context(|| format!("无法读取URL文件 {}", file_path))?;

            // 按行读取URL，忽略空行和注释
            for line in content.lines() {
                let line = line.trim();
                if !line.is_empty() && !line.starts_with('#') {
                    urls.push(line.to_string());
                }
            }
        }

        validator::validate_urls(&urls)?;
        if self.file_name.is_some() && urls.len() > 1 {
            bail!("-n 只能用于单个URL");
        }
        Ok(urls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_args_parsing() {
        let args = Args::try_parse_from(["minifetch", "-r", "4", "--timeout", "10", "https://example.com/file.zip"]).unwrap();
        assert_eq!(args.urls, vec!["https://example.com/file.zip"]);
        assert_eq!(args.retries, Some(4));
        assert_eq!(args.timeout, Some(10));
        assert!(args.download_dir.is_none());
    }

    #[test]
    fn test_config_loading() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("minifetch.conf");
        let path = path.to_str().unwrap();
        Config::default().save_with_tutorial(path).unwrap();

        let args = Args::try_parse_from(["minifetch", "-c", path, "-j", "2", "https://example.com/file.zip"]).unwrap();
        let config = args.load_config().unwrap();
        assert_eq!(config.max_concurrent_downloads, 2);

        let args = Args::try_parse_from(["minifetch", "-c", path, "-j", "0", "https://example.com/file.zip"]).unwrap();
        assert!(args.load_config().is_err());
    }

    #[test]
    fn test_url_file_parsing() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("urls.txt");
        fs::write(&file, "# 这是一个注释\nhttps://example.com/file1.zip\n\nhttps://example.com/file2.zip\n").unwrap();

        let args = Args::try_parse_from(["minifetch", "-f", file.to_str().unwrap()]).unwrap();
        let urls = args.get_urls().unwrap();
        assert_eq!(urls, vec!["https://example.com/file1.zip", "https://example.com/file2.zip"]);

        let args = Args::try_parse_from(["minifetch", "-n", "a.zip", "-f", file.to_str().unwrap()]).unwrap();
        assert!(args.get_urls().is_err());
    }

    #[test]
    fn test_invalid_urls_rejected() {
        let args = Args::try_parse_from(["minifetch", "ftp://example.com/a"]).unwrap();
        assert!(args.get_urls().is_err());

        let args = Args::try_parse_from(["minifetch"]).unwrap();
        assert!(args.get_urls().is_err());
    }
}
