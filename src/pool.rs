//! A pool which uses a [crate::connector::Connector] to maintain
//! connections, and vends out a [crate::claim::Handle] per checkout.

use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};

use crate::broker::{Broker, Event, PoolId, Request};
use crate::claim::Handle;
use crate::connector::{Connection, SharedConnector};
use crate::policy::Policy;
use crate::queue::Key;
use crate::worker;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Error, Debug)]
pub enum Error {
    /// Queueing was declined and no connection was idle.
    #[error("no idle connection available")]
    Unavailable,

    /// The wait queue stayed overloaded and this request was shed.
    #[error("request dropped from the queue after waiting {}ms", waited.as_millis())]
    Dropped { waited: Duration },

    /// The deadline elapsed before a usable connection was handed over.
    #[error("deadline reached while the request was queued")]
    DeadlineInQueue,

    /// An active checkout outlived its deadline; the connection was torn
    /// down underneath it.
    #[error(
        "client timed out because it queued and checked out the connection \
         for longer than {}ms",
        elapsed.as_millis()
    )]
    Timeout { elapsed: Duration },

    /// The request or connection was presented to a pool that cannot own
    /// it.
    #[error("the pool cannot transfer a connection it does not own")]
    ForeignOwner,

    /// The pool's broker task is gone.
    #[error("pool terminated")]
    Terminated,
}

/// Per-checkout knobs for [Pool::checkout_with].
#[derive(Clone, Debug)]
pub struct CheckoutOptions {
    /// Whether to wait in line when no connection is idle. When false, a
    /// busy pool fails the checkout immediately with
    /// [Error::Unavailable].
    pub queue: bool,

    /// Limit on the total time spent queued plus checked out. `None`
    /// waits indefinitely: with no `deadline` either, the checkout is
    /// bounded only by the client's own behavior.
    pub timeout: Option<Duration>,

    /// Absolute cap on the checkout. When both this and `timeout` are
    /// set, the earlier instant wins.
    pub deadline: Option<Instant>,
}

impl Default for CheckoutOptions {
    fn default() -> Self {
        Self {
            queue: true,
            timeout: Some(Duration::from_millis(5000)),
            deadline: None,
        }
    }
}

fn effective_deadline(
    now: Instant,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
) -> Option<Instant> {
    match (timeout, deadline) {
        (Some(timeout), Some(deadline)) => Some(std::cmp::min(now + timeout, deadline)),
        (Some(timeout), None) => Some(now + timeout),
        (None, deadline) => deadline,
    }
}

/// Manages a bounded set of connections, multiplexing them among
/// checkouts first-come first-served.
pub struct Pool<Conn: Connection> {
    id: PoolId,
    cmd_tx: mpsc::Sender<Request<Conn>>,
    evt_tx: mpsc::UnboundedSender<Event<Conn>>,
    next_token: AtomicU64,
    checkout_timeout: Duration,
    broker: tokio::task::JoinHandle<()>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl<Conn: Connection> Pool<Conn> {
    /// Creates a new connection pool.
    ///
    /// - connector: Describes how connections to the backend should be
    ///   made and health-checked.
    /// - policy: Sizing and queue-discipline knobs.
    pub fn new(connector: SharedConnector<Conn>, policy: Policy) -> Self {
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (evt_tx, evt_rx) = mpsc::unbounded_channel();
        let checkout_timeout = policy.checkout_timeout;
        let connections = policy.connections;

        let broker = Broker::new(
            id,
            policy,
            connector.clone(),
            cmd_rx,
            evt_rx,
            evt_tx.clone(),
            Instant::now(),
        );
        let broker = tokio::task::spawn(broker.run());
        let workers = (0..connections)
            .map(|_| tokio::task::spawn(worker::run(id, connector.clone(), cmd_tx.clone())))
            .collect();

        Self {
            id,
            cmd_tx,
            evt_tx,
            next_token: AtomicU64::new(0),
            checkout_timeout,
            broker,
            workers,
        }
    }

    /// Acquires a connection with the pool's default timeout.
    pub async fn checkout(&self) -> Result<Handle<Conn>, Error> {
        self.checkout_with(CheckoutOptions {
            timeout: Some(self.checkout_timeout),
            ..CheckoutOptions::default()
        })
        .await
    }

    /// Acquires a connection from the pool.
    ///
    /// An idle connection is handed over immediately; otherwise the
    /// request waits its turn (oldest first) until a connection is
    /// checked back in, the deadline passes, or the pool sheds the
    /// request because the queue has been overloaded for a sustained
    /// interval.
    pub async fn checkout_with(&self, options: CheckoutOptions) -> Result<Handle<Conn>, Error> {
        let submitted = Instant::now();
        let deadline = effective_deadline(submitted, options.timeout, options.deadline);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (reply, mut rx) = oneshot::channel();

        let request = Request::Checkout {
            pool: self.id,
            queue: options.queue,
            submitted,
            token,
            deadline,
            reply,
        };
        self.cmd_tx.send(request).await.map_err(|_| Error::Terminated)?;

        // If this future is abandoned (or the deadline passes below), the
        // guard tells the broker to forget the queued request.
        let mut guard = CancelGuard {
            events: self.evt_tx.clone(),
            key: (submitted, token),
            armed: true,
        };

        let received = match deadline {
            Some(at) => match tokio::time::timeout_at(at, &mut rx).await {
                Ok(received) => received,
                Err(_) => {
                    // The deadline elapsed; a handoff may still have
                    // raced it onto the reply channel.
                    return match rx.try_recv() {
                        Ok(Ok(handle)) => {
                            guard.disarm();
                            handle.disconnect(anyhow::Error::new(Error::DeadlineInQueue));
                            Err(Error::DeadlineInQueue)
                        }
                        Ok(Err(error)) => {
                            guard.disarm();
                            Err(error)
                        }
                        // Still queued; the guard removes the entry.
                        Err(_) => Err(Error::DeadlineInQueue),
                    };
                }
            },
            None => (&mut rx).await,
        };
        guard.disarm();
        received.map_err(|_| Error::Terminated)?
    }
}

impl<Conn: Connection> Drop for Pool<Conn> {
    fn drop(&mut self) {
        self.broker.abort();
        for worker in &self.workers {
            worker.abort();
        }
    }
}

struct CancelGuard<Conn: Connection> {
    events: mpsc::UnboundedSender<Event<Conn>>,
    key: Key,
    armed: bool,
}

impl<Conn: Connection> CancelGuard<Conn> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<Conn: Connection> Drop for CancelGuard<Conn> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.events.send(Event::CancelWait { key: self.key });
        }
    }
}
