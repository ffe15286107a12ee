mod executor;
mod pool;

pub use executor::Executor;
pub use pool::DistributionPool;
