//! Terminal stages: persist composites and notify the analysis service.

mod notify;
mod storage;

pub use notify::{NotificationSink, NOTIFY_FUNCTION_DEFAULT};
pub use storage::{StorageSink, DEFAULT_JPEG_QUALITY};
