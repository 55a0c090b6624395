extern crate self as mokki_hub;

mod hub;
pub mod http;
mod keys;
mod logging;

pub use hub::{Hub, OpenError};
pub use keys::{ReadKeyError, create_key, public_id, read_key};
pub use logging::init_logger;
