mod backend;
mod config;
mod constants;
mod errors;
mod events;
mod service;
mod sync;
mod tree;
mod utils;

pub use backend::*;
pub use config::*;
pub use errors::*;
pub use events::*;
pub use service::*;
pub use tree::*;
