pub mod compression;
mod config;
mod execution;
pub mod profiler;
mod server;
mod store;

pub use config::ServerConfig;
pub use execution::{DistributionPool, Executor};
pub use server::{Controller, ParameterServer, Updater};
pub use store::{KeyStore, ParamId, UpdateBuf};
