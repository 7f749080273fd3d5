//! Per-job state tracking, control-command mailbox, hook registry and
//! webhook delivery.

pub mod hooks;
pub mod manager;

pub use hooks::{is_valid_hook_url, HookClient, HookEvent, HookEventMetadata};
pub use manager::StatsManager;
