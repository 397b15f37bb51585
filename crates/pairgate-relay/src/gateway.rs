//! Listen-listen TCP gateway
//!
//! A gateway owns two listeners and relays every connection accepted on one
//! port to a connection accepted on the other. Many pairs may be relayed at
//! once, but each port keeps only one unpaired connection waiting.

use crate::error::GatewayError;
use crate::listener::{accept_loop, bind_listener, ListenerStatus, Side};
use crate::logger::{level, Logger};
use crate::relay::Relay;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Gateway configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Address both listeners bind to
    pub bind_ip: IpAddr,
    /// Port of the first listener (0 picks an ephemeral port)
    pub port1: u16,
    /// Port of the second listener (0 picks an ephemeral port)
    pub port2: u16,
}

impl GatewayConfig {
    pub fn new(port1: u16, port2: u16) -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port1,
            port2,
        }
    }

    pub fn with_bind_ip(mut self, bind_ip: IpAddr) -> Self {
        self.bind_ip = bind_ip;
        self
    }
}

/// Snapshot of both listeners
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayStatus {
    pub first: ListenerStatus,
    pub second: ListenerStatus,
}

impl GatewayStatus {
    pub fn listener(&self, side: Side) -> &ListenerStatus {
        match side {
            Side::First => &self.first,
            Side::Second => &self.second,
        }
    }
}

struct OpenGateway {
    relay: Arc<Relay>,
    local_addrs: [SocketAddr; 2],
    shutdown: CancellationToken,
}

pub struct Gateway {
    config: GatewayConfig,
    logger: Arc<dyn Logger>,
    open: Option<OpenGateway>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, logger: Arc<dyn Logger>) -> Self {
        Self {
            config,
            logger,
            open: None,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Binds both ports and starts accepting connections.
    pub async fn open(&mut self) -> Result<(), GatewayError> {
        if self.open.is_some() {
            return Err(GatewayError::AlreadyOpen);
        }

        let first = bind_listener(
            SocketAddr::new(self.config.bind_ip, self.config.port1),
            self.logger.as_ref(),
        )
        .await?;
        let second = bind_listener(
            SocketAddr::new(self.config.bind_ip, self.config.port2),
            self.logger.as_ref(),
        )
        .await?;
        let local_addrs = [first.local_addr()?, second.local_addr()?];
        let ports = [local_addrs[0].port(), local_addrs[1].port()];

        let relay = Arc::new(Relay::new(ports, self.logger.clone()));
        relay.open_listeners(ports);

        let shutdown = CancellationToken::new();
        tokio::spawn(accept_loop(
            Side::First,
            first,
            relay.clone(),
            shutdown.child_token(),
        ));
        tokio::spawn(accept_loop(
            Side::Second,
            second,
            relay.clone(),
            shutdown.child_token(),
        ));

        self.open = Some(OpenGateway {
            relay,
            local_addrs,
            shutdown,
        });
        self.log(level::GATEWAY, "TCP gateway opened.");
        Ok(())
    }

    /// Stops both listeners and closes every channel. Does nothing when the
    /// gateway is not open.
    pub fn close(&mut self) {
        let Some(open) = self.open.take() else {
            return;
        };
        self.log(level::GATEWAY, "Closing TCP gateway.");
        open.relay.close_listeners();
        open.shutdown.cancel();
    }

    /// Addresses the two listeners are bound to, once open.
    pub fn local_addrs(&self) -> Option<[SocketAddr; 2]> {
        self.open.as_ref().map(|open| open.local_addrs)
    }

    pub fn status(&self) -> Option<GatewayStatus> {
        self.open.as_ref().map(|open| {
            let [first, second] = open.relay.status();
            GatewayStatus { first, second }
        })
    }

    fn log(&self, lvl: u8, message: &str) {
        if !self.logger.check_level(lvl) {
            return;
        }
        let (port1, port2) = match self.local_addrs() {
            Some([first, second]) => (first.port(), second.port()),
            None => (self.config.port1, self.config.port2),
        };
        self.logger
            .log(lvl, &format!("Gateway {}/{}: {}", port1, port2, message));
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.close();
    }
}
