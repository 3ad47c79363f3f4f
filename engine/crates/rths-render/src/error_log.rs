//! 进程级的错误通道
//!
//! 宿主只能拿到最近一次错误的文本，每次新的错误都会覆盖之前的内容。

use std::fmt::Display;

use parking_lot::Mutex;

static LAST_ERROR: Mutex<String> = parking_lot::const_mutex(String::new());

/// 记录一次错误，同时输出到日志
pub fn report(err: impl Display) {
    let msg = err.to_string();
    log::error!("{}", msg);
    *LAST_ERROR.lock() = msg;
}

/// 最近一次错误的文本，没有错误时为空
pub fn error_log() -> String {
    LAST_ERROR.lock().clone()
}

/// 清空错误通道
pub fn clear_error_log() {
    LAST_ERROR.lock().clear();
}

/// 对 `Result` 的错误分支调用 [`report`]
pub trait ReportExt {
    fn reported(self) -> Self;
}

impl<T, E: Display> ReportExt for Result<T, E> {
    #[inline]
    fn reported(self) -> Self {
        if let Err(e) = &self {
            report(e);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_overwrites_previous_error() {
        report("first failure");
        report("second failure");
        assert_eq!(error_log(), "second failure");

        let r: Result<(), &str> = Err("third failure");
        assert!(r.reported().is_err());
        assert_eq!(error_log(), "third failure");

        clear_error_log();
        assert!(error_log().is_empty());
    }
}
