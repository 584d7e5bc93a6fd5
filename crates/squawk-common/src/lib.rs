pub mod errors;
pub mod id;

pub use errors::{ConfigError, RadioError, StoreError};
pub use id::{new_id, ClientId};

pub type Result<T> = std::result::Result<T, RadioError>;
