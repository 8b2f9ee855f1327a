//! Workbench operator: Notebook reconciliation controller and mutating
//! admission webhook.

pub mod config;
pub mod controller;
pub mod index;
pub mod webhook;

pub use config::OperatorConfig;
pub use workbench_common::Error;
