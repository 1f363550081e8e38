//! Keeps a privileged-mode permission flag, stored in a settings file shared
//! with an external tool, in sync with an in-process approval workflow.

pub mod config;
pub mod core;
pub mod logging;
pub mod permission;
pub mod store;
pub mod ui;
