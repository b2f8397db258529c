//! Utilities to help with testing corral.

use crate::connector::{Connector, Error};

use anyhow::anyhow;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A scriptable connector whose connections are plain serial numbers.
///
/// Each successful connect hands out the next serial, so a test can tell
/// whether a checkout reused an existing connection or got a fresh one.
pub(crate) struct StubConnector {
    connects: AtomicUsize,
    pings: AtomicUsize,
    failing_connects: AtomicUsize,
    fail_pings: AtomicBool,
}

impl StubConnector {
    pub(crate) fn new() -> Self {
        Self {
            connects: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            failing_connects: AtomicUsize::new(0),
            fail_pings: AtomicBool::new(false),
        }
    }

    /// Make the next `n` connect attempts fail.
    pub(crate) fn fail_next_connects(&self, n: usize) {
        self.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Make every idle health check fail from now on.
    pub(crate) fn fail_pings(&self) {
        self.fail_pings.store(true, Ordering::SeqCst);
    }

    /// Connect attempts so far, successful or not.
    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Idle health checks performed so far.
    pub(crate) fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for StubConnector {
    type Connection = usize;

    async fn connect(&self) -> Result<usize, Error> {
        let serial = self.connects.fetch_add(1, Ordering::SeqCst);
        let remaining = self
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if remaining {
            return Err(anyhow!("injected connect failure").into());
        }
        Ok(serial)
    }

    async fn is_valid(&self, _conn: &mut usize) -> Result<(), Error> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.fail_pings.load(Ordering::SeqCst) {
            return Err(anyhow!("injected ping failure").into());
        }
        Ok(())
    }
}
