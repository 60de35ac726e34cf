pub mod config;
pub mod error;
pub mod host;
pub mod message;
pub mod paths;

pub use config::{Account, Config, SecretSource};
pub use error::{Error, Result};
pub use host::{HostServices, ReplySink};
pub use message::{
    Attachment, ChatKind, InboundEvent, MediaSource, OutboundIntent, OutboundResult, SendTarget,
};
pub use paths::Paths;
