//! CLI command implementations

pub mod deploy_hooks;
pub mod example_config;
pub mod setup;
pub mod validate;

pub use deploy_hooks::deploy_hooks;
pub use example_config::example_config;
pub use setup::setup;
pub use validate::validate;
