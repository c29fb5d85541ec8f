//! Live configuration: entities, validation and the thread-safe store.

mod file;
mod model;
mod store;

pub use file::read_config_file;
pub use model::{
    extract_json_path, references_auth, resolve_auth, AuthConfig, AuthRef, AuthType, Endpoint,
    IncomingRoute, InlineAuth, ResponseSpec, TokenEndpoint, TrafficConfig, SHARE_TOLERANCE,
    VALID_METHODS,
};
pub use store::{ConfigStore, StoreError, StoreResult};
