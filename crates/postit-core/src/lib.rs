pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod histogram;
pub mod job;
pub mod metrics;
pub mod policy;
pub mod pool;
pub mod progress;
pub mod rate;
pub mod reader;
pub mod record;
pub mod report;
pub mod request;
pub mod stats;
pub mod writer;

pub use client::*;
pub use config::*;
pub use controller::*;
pub use error::*;
pub use histogram::*;
pub use job::*;
pub use metrics::*;
pub use policy::*;
pub use pool::*;
pub use progress::*;
pub use rate::*;
pub use reader::*;
pub use record::*;
pub use report::{format_duration, render, ReportOptions};
pub use request::*;
pub use stats::*;
pub use writer::*;
