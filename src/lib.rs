//! Live client for a cloud-drive auto-save task server: polls task status
//! and logs, keeps a local mirror, and turns operator commands into remote
//! calls.

pub mod core;
pub mod remote;
