//! Router configuration: YAML file loading and raw server entries.

pub mod loader;
pub mod types;

pub use loader::{find_config_path, load_config, parse_config};
pub use types::{RawServerConfig, RouterConfig, RouterSettings};
