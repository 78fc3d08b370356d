use anyhow::{Context, Result};
use log::LevelFilter;
use minifetch::cli;
use minifetch::core::{
    fixed_destination, suggested_destination, DownloadOptions, ExponentialBackoffRetrier, HttpTransport,
    LoggingObserver, RequestDescription, SessionManager,
};
use minifetch::ui::{self, DownloadSummary, ProgressManager, TaskProgress};
use minifetch::utils::logger::{FileLogger, DEFAULT_MAX_SIZE};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// 单个URL的下载结果
struct Outcome {
    url: String,
    result: Result<PathBuf>,
    size: u64,
    retries: u32,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        ui::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // 解析参数和配置
    let (args, config) = cli::Args::parse_args()?;
    init_logging(args.log_file.as_deref(), args.verbose)?;

    let urls = args.get_urls().context("获取URL列表失败")?;
    log::info!("程序启动，共 {} 个URL", urls.len());
    log::info!("配置文件路径: {}", args.config);
    log::debug!("{}", config.get_summary());
    println!("{}", config.get_summary());

    let transport = Arc::new(HttpTransport::from_config(&config)?);
    let manager = SessionManager::builder(transport)
        .config(&config)
        .retrier(ExponentialBackoffRetrier::from_config(&config))
        .observer(LoggingObserver)
        .build()?;

    let progress = Arc::new(ProgressManager::new());
    let permits = Arc::new(Semaphore::new(config.max_concurrent_downloads));
    let options = config.download_options();
    let started = Instant::now();

    let mut downloads = JoinSet::new();
    for url in urls {
        let manager = manager.clone();
        let progress = progress.clone();
        let permits = permits.clone();
        let dir = PathBuf::from(&config.download_dir);
        let name = args.file_name.clone();
        downloads.spawn(async move {
            // 信号量不会被关闭
            let _permit = permits.acquire_owned().await.ok();
            download_one(&manager, &progress, url, &dir, name, options).await
        });
    }

    let mut summary = DownloadSummary::default();
    while let Some(joined) = downloads.join_next().await {
        let outcome = joined.context("下载任务异常退出")?;
        summary.total_files += 1;
        summary.retry_count += outcome.retries;
        match outcome.result {
            Ok(path) => {
                summary.success_count += 1;
                summary.total_size += outcome.size;
                log::info!("下载完成: {} -> {:?}", outcome.url, path);
            }
            Err(e) => {
                summary.failed_count += 1;
                log::error!("下载失败: {} - {:#}", outcome.url, e);
                progress.println(&format!("✗ {}: {:#}", outcome.url, e));
            }
        }
    }
    summary.elapsed_time = started.elapsed();
    println!("{}", summary);
    log::logger().flush();

    if summary.failed_count > 0 {
        anyhow::bail!("{} 个下载失败", summary.failed_count);
    }
    Ok(())
}

fn init_logging(log_file: Option<&str>, verbose: bool) -> Result<()> {
    let level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };
    match log_file {
        Some(path) => {
            let logger = FileLogger::new(path, level, DEFAULT_MAX_SIZE)
                .with_context(|| format!("无法打开日志文件 {}", path))?;
            logger.init().context("日志系统初始化失败")?;
        }
        None => {
            // 默认只输出警告，避免打乱进度条
            let default = if verbose { "debug" } else { "warn" };
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
        }
    }
    Ok(())
}

fn display_name(url: &str, name: Option<&str>) -> String {
    if let Some(name) = name {
        return name.to_string();
    }
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.path_segments().and_then(|s| s.last().map(str::to_string)))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| url.to_string())
}

async fn download_one(
    manager: &SessionManager,
    progress: &ProgressManager,
    url: String,
    dir: &Path,
    name: Option<String>,
    options: DownloadOptions,
) -> Outcome {
    let bar = progress.add_bar(&display_name(&url, name.as_deref()));
    let description = match RequestDescription::get(&url) {
        Ok(description) => description,
        Err(e) => {
            bar.finish_error(&e.to_string());
            return Outcome { url, result: Err(e.into()), size: 0, retries: 0 };
        }
    };

    let destination = match &name {
        Some(name) => fixed_destination(dir.join(name), options),
        None => suggested_destination(dir, options),
    };
    let request = manager.download(description, Some(destination));
    let handle: TaskProgress = bar.clone();
    request.validate_success().on_progress(move |p| handle.update(p));
    if !manager.start_requests_immediately() {
        request.resume();
    }

    let response = request.download_response_async().await;
    let retries = response.timeline.retry_count;
    let size = request.progress().completed;
    let result = response.into_result().map_err(anyhow::Error::from);
    match &result {
        Ok(path) => bar.finish_success(&path.display().to_string()),
        Err(e) => bar.finish_error(&e.to_string()),
    }
    Outcome { url, result, size, retries }
}
