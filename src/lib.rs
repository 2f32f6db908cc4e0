#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod background;
pub mod cache;
pub mod codec;
mod config;
mod core;
mod error;
pub mod executor;
mod jobs;
pub mod remote;
pub mod request;
mod resolve;
mod system;
#[cfg(test)]
mod testing;
mod utils;
mod value;

pub use crate::background::{BackgroundRequestPtr, BackgroundRequestSystem, RequestUpdate};
pub use crate::config::{
    DiskCacheConfig, RemoteConfig, ResolutionPolicy, SystemConfig, WorkerConfig,
};
pub use crate::core::{ArcStr, Hash32};
pub use crate::error::*;
pub use crate::request::Request;
pub use crate::resolve::{Interest, PreresolutionPhase, ResolutionState, Resolved, Resolver};
pub use crate::system::{ExecutionSystem, ExecutionSystemBuilder, RequestContext};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
pub use crate::value::{Blob, FromValue, IntoValue, Value};
