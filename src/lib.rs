pub mod ammo;
pub mod config;
pub mod error;
pub mod listener;
pub mod replay;
pub mod responder;

pub use config::ListenConfig;
pub use error::Error;
