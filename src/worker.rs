//! The connection worker: drives the lifecycle of a single connection.
//!
//! Each worker connects, publishes the connection to the broker, and then
//! sleeps until the broker retires it — because a client disconnected it,
//! a checkout blew its deadline, or an idle ping failed. Retirement with
//! a respawn verdict starts the cycle over; a stop verdict ends the
//! worker for good.

use crate::backoff::Backoff;
use crate::broker::{PoolId, Request, Retire};
use crate::connector::{Connection, SharedConnector};

use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;
use tracing::{debug, warn};

const RECONNECT_START: Duration = Duration::from_millis(100);
const RECONNECT_MAX: Duration = Duration::from_secs(10);

pub(crate) async fn run<Conn: Connection>(
    pool: PoolId,
    connector: SharedConnector<Conn>,
    cmd_tx: mpsc::Sender<Request<Conn>>,
) {
    let mut backoff = Backoff::new(RECONNECT_START, RECONNECT_MAX);
    loop {
        let conn = loop {
            match connector.connect().await {
                Ok(conn) => break conn,
                Err(error) => {
                    warn!(%error, "connect failed; backing off");
                    tokio::time::sleep(backoff.advance()).await;
                }
            }
        };
        backoff.reset();

        let (retire_tx, retire_rx) = oneshot::channel();
        let install = Request::Install {
            pool,
            conn,
            retire: retire_tx,
        };
        if cmd_tx.send(install).await.is_err() {
            // The broker is gone; so is the pool.
            return;
        }

        match retire_rx.await {
            Ok(Retire::Respawn(cause)) => {
                debug!(%cause, "connection retired; reconnecting");
            }
            Ok(Retire::Stop(cause)) => {
                debug!(%cause, "worker stopped");
                return;
            }
            // The broker dropped the retire sender without a verdict.
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::StubConnector;
    use anyhow::anyhow;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn reconnects_until_stopped() {
        let connector: SharedConnector<usize> = Arc::new(StubConnector::new());
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let task = tokio::spawn(run(7, connector, cmd_tx));

        let Some(Request::Install { pool, retire, .. }) = cmd_rx.recv().await else {
            panic!("worker never installed");
        };
        assert_eq!(pool, 7);
        retire.send(Retire::Respawn(anyhow!("recycled"))).unwrap();

        let Some(Request::Install { retire, .. }) = cmd_rx.recv().await else {
            panic!("worker never reconnected");
        };
        retire.send(Retire::Stop(anyhow!("done"))).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn backs_off_through_failed_connects() {
        let connector = Arc::new(StubConnector::new());
        connector.fail_next_connects(2);
        let shared: SharedConnector<usize> = connector.clone();
        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let task = tokio::spawn(run(1, shared, cmd_tx));

        let request = cmd_rx.recv().await.expect("worker never installed");
        assert!(matches!(request, Request::Install { .. }));
        assert_eq!(connector.connects(), 3);
        task.abort();
    }
}
