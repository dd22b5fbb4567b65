pub mod cli;
pub mod config;
pub mod protocol;

pub use cli::{Command, prompt};
pub use config::{MllpConfig, ReconnectPolicy};
pub use protocol::{
    Acknowledgement, Exchange, HandlerError, HandlerRegistry, MessageHandler, MllpClient,
    MllpError, MllpServer, Outcome,
};
