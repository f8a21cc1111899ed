//! CLI commands

mod cache;
mod configure;
mod init;
mod plan;
mod run;
mod toolchain;

pub use cache::CacheCommand;
pub use configure::ConfigureCommand;
pub use init::InitCommand;
pub use plan::PlanCommand;
pub use run::RunCommand;
pub use toolchain::ToolchainCommand;
