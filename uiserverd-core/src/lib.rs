pub mod assuan;
pub mod checksum;
pub mod command;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod server;
pub mod session;
pub mod task;
pub mod watcher;

// Re-export common types
pub use crate::command::{CommandHandler, CommandRegistry};
pub use crate::config::UiServerConfig;
pub use crate::controller::{
    ChecksumCreateController, ChecksumVerifyController, ControllerEvent, DecryptVerifyController,
    SignEncryptEmailController, SignEncryptFilesController,
};
pub use crate::engine::{
    AgentTransport, Certificate, CertificateResolver, CryptoEngine, GpgAgentTransport, IoSpec,
    NullCertificateResolver, NullEngine, Protocol, TaskKind, TaskOutput, TaskSpec,
};
pub use crate::error::{CommandError, CommandResult};
pub use crate::server::{Connection, Services, UiServer};
pub use crate::session::SessionDataHandler;
pub use crate::watcher::{DeviceInfoWatcher, WatcherEvent};
