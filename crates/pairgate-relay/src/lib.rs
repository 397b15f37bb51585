//! Paired-listener TCP relay gateway
//!
//! A [`Gateway`] listens on two TCP ports. Each connection arriving on one
//! port is bound to a connection arriving on the other and the two are relayed
//! byte for byte until either side goes away. Each port holds at most one
//! unpaired connection; a newer unmatched arrival evicts it.
//!
//! ```ignore
//! use pairgate_relay::{Gateway, GatewayConfig, TracingLogger};
//! use std::sync::Arc;
//!
//! let mut gateway = Gateway::new(GatewayConfig::new(7001, 7002), Arc::new(TracingLogger::new(5)));
//! gateway.open().await?;
//! // ...
//! gateway.close();
//! ```

pub mod channel;
pub mod error;
pub mod gateway;
mod io;
pub mod listener;
pub mod logger;
mod relay;
mod state;


pub use channel::{ChannelId, CloseMode, RECEIVE_CHUNK_SIZE, RETENTION_CAPACITY};
pub use error::{DisconnectCause, GatewayError};
pub use gateway::{Gateway, GatewayConfig, GatewayStatus};
pub use listener::{ListenerStatus, Side};
pub use logger::{level, Logger, TracingLogger};
