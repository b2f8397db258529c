//! Implementation of [Connector] for TCP.

use crate::connector::{Connector, Error};

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::TcpStream;

/// Pools raw TCP connections to a single backend address.
pub struct TcpConnector {
    address: SocketAddr,
}

impl TcpConnector {
    pub fn new(address: SocketAddr) -> Self {
        Self { address }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Connection = TcpStream;

    async fn connect(&self) -> Result<Self::Connection, Error> {
        TcpStream::connect(self.address)
            .await
            .map_err(|e| Error::Other(e.into()))
    }

    async fn is_valid(&self, _conn: &mut Self::Connection) -> Result<(), Error> {
        // A raw TcpStream can't be probed without the server's
        // cooperation: a zero-length read proves nothing, and a real read
        // would interfere with the connection's traffic. Servers that
        // speak a ping/pong exchange should get a dedicated connector
        // wrapping this one.
        Ok(())
    }
}
