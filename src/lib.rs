pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod server;
pub mod translate;

pub use config::BridgeConfig;
pub use error::{BridgeError, Result, UnsupportedFeature};
pub use logging::SharedJournal;
pub use server::{build_router, AppState};
