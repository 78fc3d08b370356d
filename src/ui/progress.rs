use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::core::task::Progress;

const BAR_TEMPLATE: &str = "{msg:20!} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} ETA {eta}";
const SPINNER_TEMPLATE: &str = "{spinner} {msg:20!} {bytes} {bytes_per_sec}";

// 结构体：ProgressManager
// 每个请求一条进度条，总长度未知时显示为旋转指示
pub struct ProgressManager {
    multi: MultiProgress,
}

impl Default for ProgressManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressManager {
    pub fn new() -> Self {
        ProgressManager { multi: MultiProgress::new() }
    }

    /// 不输出到终端，用于测试和 --log-file 之外的静默场景
    pub fn hidden() -> Self {
        ProgressManager { multi: MultiProgress::with_draw_target(ProgressDrawTarget::hidden()) }
    }

    pub fn add_bar(&self, name: &str) -> TaskProgress {
        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(spinner_style());
        bar.set_message(name.to_string());
        TaskProgress { bar }
    }

    /// 在进度条上方打印一行，不打乱进度条
    pub fn println(&self, line: &str) {
        if self.multi.println(line).is_err() {
            println!("{}", line);
        }
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(BAR_TEMPLATE)
        .map(|style| style.progress_chars("=>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template(SPINNER_TEMPLATE).unwrap_or_else(|_| ProgressStyle::default_spinner())
}

/// 单个请求的进度条句柄，可以移进进度回调
#[derive(Clone)]
pub struct TaskProgress {
    bar: ProgressBar,
}

impl TaskProgress {
    /// 总长度第一次出现（或因重试变化）时切换成进度条
    pub fn update(&self, progress: Progress) {
        if let Some(total) = progress.total {
            if self.bar.length() != Some(total) {
                self.bar.set_length(total);
                self.bar.set_style(bar_style());
            }
        } else {
            self.bar.tick();
        }
        self.bar.set_position(progress.completed);
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    pub fn finish_success(&self, message: &str) {
        self.bar.finish_with_message(format!("✓ {}", message));
    }

    pub fn finish_error(&self, message: &str) {
        self.bar.abandon_with_message(format!("✗ {}", message));
    }

    pub fn is_finished(&self) -> bool {
        self.bar.is_finished()
    }
}
