use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Success,
    Info,
    Warning,
    Error,
}

/// User-visible notification sink. Fire and forget.
pub trait Notifier: Send + Sync {
    fn display(&self, kind: NoticeKind, message: &str);
}

/// Routes notices into the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn display(&self, kind: NoticeKind, message: &str) {
        match kind {
            NoticeKind::Success | NoticeKind::Info => info!(target: "scribe::notice", ?kind, "{message}"),
            NoticeKind::Warning => warn!(target: "scribe::notice", "{message}"),
            NoticeKind::Error => error!(target: "scribe::notice", "{message}"),
        }
    }
}
