mod loader;
mod schema;

pub use loader::{
    config_dir, default_config_path, load_default, load_from_path, substitute_env_vars,
    substituted_headers, validate, validate_for_server, ENV_PREFIX,
};
pub use schema::*;
