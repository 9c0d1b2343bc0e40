pub mod controller;
pub mod notifier;
pub mod rate_limiter;
pub mod reconciler;
pub mod work_queue;
