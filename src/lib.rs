pub mod config;
pub mod errors;
pub mod github;
pub mod jenkins;
pub mod jira;
pub mod message;
pub mod poller;
pub mod portal;
pub mod server;

pub use config::ServerConfig;
pub use errors::PortalError;
pub use message::{Message, MessageBus};
pub use portal::{Candidate, Portal, PortalId, PortalService, RunState};
