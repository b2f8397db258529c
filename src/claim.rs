//! Connections which are checked out from the connection pool.

use crate::broker::{Event, HolderId, PoolId, TimerId};
use crate::connector::Connection;

use tokio::sync::mpsc;

/// A ticket for an active checkout.
///
/// The handle owns the connection for as long as it lives. Dropping it
/// checks the connection back in, so a client that dies with a claim
/// outstanding returns the connection to the pool rather than leaking it.
/// [Handle::disconnect] and [Handle::stop] give it back with prejudice.
pub struct Handle<Conn: Connection> {
    conn: Option<Conn>,
    holder: HolderId,
    deadline: Option<TimerId>,
    pool: PoolId,
    events: mpsc::UnboundedSender<Event<Conn>>,
}

impl<Conn: Connection> Handle<Conn> {
    pub(crate) fn new(
        conn: Conn,
        holder: HolderId,
        deadline: Option<TimerId>,
        pool: PoolId,
        events: mpsc::UnboundedSender<Event<Conn>>,
    ) -> Self {
        Self {
            conn: Some(conn),
            holder,
            deadline,
            pool,
            events,
        }
    }

    /// Return the connection to the pool for reuse.
    ///
    /// Equivalent to dropping the handle; provided so the intent can be
    /// spelled out at the call site.
    pub fn checkin(self) {}

    /// Return the connection and ask the pool to tear it down.
    ///
    /// The pool connects a replacement. Use this when the connection is
    /// known to be poisoned, e.g. a protocol desync.
    pub fn disconnect(mut self, cause: anyhow::Error) {
        if let Some(conn) = self.conn.take() {
            let _ = self.events.send(Event::Disconnect {
                holder: self.holder,
                conn,
                cause,
            });
        }
    }

    /// Return the connection, tear it down, and retire its worker without
    /// a replacement, permanently shrinking the pool.
    pub fn stop(mut self, cause: anyhow::Error) {
        if let Some(conn) = self.conn.take() {
            let _ = self.events.send(Event::Stop {
                holder: self.holder,
                conn,
                cause,
            });
        }
    }

    // Recovers the connection from a handle that never reached its
    // recipient, without a checkin bouncing back through the event
    // channel.
    pub(crate) fn dismantle(mut self) -> Conn {
        self.conn.take().expect("dismantled handle already empty")
    }
}

impl<Conn: Connection> std::ops::Deref for Handle<Conn> {
    type Target = Conn;

    fn deref(&self) -> &Conn {
        self.conn.as_ref().expect("handle used after teardown")
    }
}

impl<Conn: Connection> std::ops::DerefMut for Handle<Conn> {
    fn deref_mut(&mut self) -> &mut Conn {
        self.conn.as_mut().expect("handle used after teardown")
    }
}

impl<Conn: Connection> std::fmt::Debug for Handle<Conn> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("holder", &self.holder)
            .field("pool", &self.pool)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl<Conn: Connection> Drop for Handle<Conn> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = self.events.send(Event::Checkin {
                holder: self.holder,
                conn,
            });
        }
    }
}
