//! Transparent interception session for the length-prefixed game protocol.

pub mod config;
pub mod config_loader;
pub mod key_source;
pub mod session;

pub use config::InterceptorConfig;
pub use config_loader::ConfigLoader;
pub use key_source::{CandidateFuture, KeySource, StaticKeySource};
pub use session::{CloseReason, Interceptor, SessionError, SessionState};
