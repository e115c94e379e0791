//! Localized CLI text for autosave-sync.
//! Locale can be selected via the `--locale` CLI flag (e.g. `--locale zh`).

use autosave_sync::core::model::TaskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Locale {
    #[default]
    En,
    Zh,
}

impl Locale {
    pub fn from_str(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "zh" | "zh-cn" | "zh_cn" | "zh-hans" | "zh-tw" | "zh_tw" => Self::Zh,
            _ => Self::En,
        }
    }
}

pub struct Messages {
    pub status_normal: &'static str,
    pub status_running: &'static str,
    pub status_success: &'static str,
    pub status_error: &'static str,
    pub polling_started: &'static str,
    pub polling_stopped: &'static str,
    pub watching_hint: &'static str,
    pub no_tasks: &'static str,
    pub stats_header: &'static str,
    pub execute_accepted: &'static str,
    pub batch_summary: &'static str,
    pub transferred: &'static str,
    pub task_added: &'static str,
    pub task_deleted: &'static str,
    pub task_moved: &'static str,
    pub all_idle: &'static str,
    pub error_prefix: &'static str,
    pub log_prefix: &'static str,
}

impl Messages {
    pub fn status(&self, status: TaskStatus) -> &'static str {
        match status {
            TaskStatus::Normal => self.status_normal,
            TaskStatus::Running => self.status_running,
            TaskStatus::Success => self.status_success,
            TaskStatus::Error => self.status_error,
        }
    }
}

pub static EN: Messages = Messages {
    status_normal: "idle",
    status_running: "running",
    status_success: "done",
    status_error: "error",
    polling_started: "Polling started",
    polling_stopped: "Polling stopped",
    watching_hint: "Press Ctrl-C to quit",
    no_tasks: "No tasks configured",
    stats_header: "Tasks",
    execute_accepted: "Execution accepted",
    batch_summary: "Batch",
    transferred: "transferred",
    task_added: "Task added",
    task_deleted: "Deleted",
    task_moved: "Moved",
    all_idle: "No task running",
    error_prefix: "ERR",
    log_prefix: "LOG",
};

pub static ZH: Messages = Messages {
    status_normal: "正常",
    status_running: "运行中",
    status_success: "成功",
    status_error: "错误",
    polling_started: "轮询已启动",
    polling_stopped: "轮询已停止",
    watching_hint: "按 Ctrl-C 退出",
    no_tasks: "暂无任务",
    stats_header: "任务",
    execute_accepted: "已开始执行",
    batch_summary: "批量执行",
    transferred: "已转存",
    task_added: "任务已添加",
    task_deleted: "已删除",
    task_moved: "已移动",
    all_idle: "没有正在运行的任务",
    error_prefix: "错误",
    log_prefix: "日志",
};

pub fn get_messages(locale: Locale) -> &'static Messages {
    match locale {
        Locale::En => &EN,
        Locale::Zh => &ZH,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chinese_variants_pick_zh() {
        assert_eq!(Locale::from_str("zh-CN"), Locale::Zh);
        assert_eq!(Locale::from_str("fr"), Locale::En);
    }

    #[test]
    fn status_labels_follow_locale() {
        assert_eq!(get_messages(Locale::Zh).status(TaskStatus::Running), "运行中");
        assert_eq!(get_messages(Locale::En).status(TaskStatus::Error), "error");
    }
}
