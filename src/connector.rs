//! The interface for establishing and checking the pool's connections.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A connection which may be managed by the pool.
pub trait Connection: Send + 'static {}
impl<T: Send + 'static> Connection for T {}

/// Describes how the pool's connections should be constructed and kept
/// healthy.
///
/// The connector decides everything about reaching the backend: address,
/// authentication, protocol setup. The pool only asks it for fresh
/// connections and for idle health checks.
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Connection;

    /// Creates a connection to the backend.
    async fn connect(&self) -> Result<Self::Connection, Error>;

    /// Determines if an idle connection is still valid.
    ///
    /// Called periodically for the longest-idle connection so that it is
    /// exercised before a client is handed a dead socket. A failure tears
    /// the connection down and a replacement is connected.
    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Error>;
}

pub type SharedConnector<Conn> = Arc<dyn Connector<Connection = Conn>>;
