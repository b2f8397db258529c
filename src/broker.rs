//! The checkout broker: a single task that pairs waiting clients with
//! idle connections.
//!
//! All pool state lives here and is mutated one event at a time. Clients,
//! connection workers and ping tasks talk to the broker purely through
//! messages; the connection itself moves across task boundaries by value,
//! so at any instant exactly one party can touch it.

use crate::claim::Handle;
use crate::codel::ControlledDelay;
use crate::connector::{self, Connection, SharedConnector};
use crate::policy::Policy;
use crate::pool::Error;
use crate::queue::{Key, TimeQueue};

use anyhow::anyhow;
use debug_ignore::DebugIgnore;
use derive_where::derive_where;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

pub(crate) type HolderId = u64;
pub(crate) type TimerId = u64;
pub(crate) type PoolId = u64;

/// Why a connection worker's current connection is done.
#[derive(Debug)]
pub(crate) enum Retire {
    /// The connection was torn down; the worker should connect a
    /// replacement.
    Respawn(anyhow::Error),

    /// The worker should exit without reconnecting.
    Stop(anyhow::Error),
}

/// Requests submitted by pool front-ends and connection workers.
pub(crate) enum Request<Conn: Connection> {
    Checkout {
        pool: PoolId,
        queue: bool,
        submitted: Instant,
        token: u64,
        deadline: Option<Instant>,
        reply: oneshot::Sender<Result<Handle<Conn>, Error>>,
    },

    /// A worker established a connection and publishes it to the pool.
    Install {
        pool: PoolId,
        conn: Conn,
        retire: oneshot::Sender<Retire>,
    },
}

/// Feedback produced without awaiting the broker: handle returns, ping
/// results, abandoned waits. Sent on an unbounded channel so `Drop`
/// implementations can emit them.
pub(crate) enum Event<Conn> {
    Checkin {
        holder: HolderId,
        conn: Conn,
    },
    Disconnect {
        holder: HolderId,
        conn: Conn,
        cause: anyhow::Error,
    },
    Stop {
        holder: HolderId,
        conn: Conn,
        cause: anyhow::Error,
    },
    PingOk {
        holder: HolderId,
        conn: Conn,
    },
    PingFailed {
        holder: HolderId,
        cause: connector::Error,
    },
    /// A queued client gave up (deadline, cancellation, death); its wait
    /// entry should be removed.
    CancelWait {
        key: Key,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// No connection is idle; zero or more clients wait.
    Busy,
    /// At least one connection is idle and nobody waits.
    Ready,
}

#[derive_where(Debug)]
enum HolderState<Conn> {
    /// Owned by the pool, sitting in the ready queue.
    Idle(DebugIgnore<Conn>),

    /// The connection has been moved into a client's [Handle].
    Claimed {
        /// Identity of the deadline timer governing this checkout. A
        /// fired timer carrying any other id is from an earlier tenant
        /// and must be ignored.
        deadline: Option<TimerId>,
        /// When the checkout was submitted, for the timeout error.
        since: Instant,
    },

    /// The connection is briefly outside the pool: with the idle
    /// health-check task, or in the broker's hands mid-placement.
    Detached,
}

#[derive_where(Debug)]
struct Holder<Conn> {
    state: HolderState<Conn>,
    /// Position in the ready queue while idle.
    ready_key: Option<Key>,
    /// Wakes the owning worker when the connection is destroyed.
    retire: oneshot::Sender<Retire>,
}

#[derive_where(Debug)]
struct Waiter<Conn: Connection> {
    reply: oneshot::Sender<Result<Handle<Conn>, Error>>,
    /// Absolute deadline for the whole checkout, armed at handoff.
    deadline: Option<Instant>,
}

#[derive(Debug)]
enum TimerKind {
    /// A checkout hit its deadline.
    Deadline { holder: HolderId },
    /// Periodic wait-queue delay sample.
    Poll { cursor: Instant },
    /// Periodic idle-connection ping.
    Idle { cursor: Instant },
}

/// Timers armed by the broker, fired from its event loop.
///
/// Entries are never cancelled eagerly: each carries a unique id, and the
/// resource a timer governs records the id it currently honors. A popped
/// timer with a stale id is discarded, which makes late fires harmless.
#[derive(Debug)]
struct TimerWheel {
    entries: BTreeMap<(Instant, TimerId), TimerKind>,
    next_id: TimerId,
}

impl TimerWheel {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 0,
        }
    }

    fn arm(&mut self, at: Instant, kind: TimerKind) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert((at, id), kind);
        id
    }

    fn next_due(&self) -> Option<Instant> {
        self.entries.keys().next().map(|&(at, _)| at)
    }

    fn pop_due(&mut self, now: Instant) -> Option<(TimerId, TimerKind)> {
        let (&(at, id), _) = self.entries.first_key_value()?;
        if at > now {
            return None;
        }
        let kind = self.entries.remove(&(at, id)).expect("due key was just seen");
        Some((id, kind))
    }
}

pub(crate) struct Broker<Conn: Connection> {
    pool: PoolId,
    policy: Policy,
    connector: SharedConnector<Conn>,

    mode: Mode,
    wait: TimeQueue<Waiter<Conn>>,
    ready: TimeQueue<HolderId>,
    holders: HashMap<HolderId, Holder<Conn>>,
    codel: ControlledDelay,
    timers: TimerWheel,

    /// Identities of the currently-honored periodic timers; fired timers
    /// with any other id are late fires from a superseded arming.
    poll_timer: TimerId,
    idle_timer: TimerId,

    next_holder: HolderId,

    cmd_rx: mpsc::Receiver<Request<Conn>>,
    evt_rx: mpsc::UnboundedReceiver<Event<Conn>>,
    evt_tx: mpsc::UnboundedSender<Event<Conn>>,
}

impl<Conn: Connection> Broker<Conn> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        pool: PoolId,
        policy: Policy,
        connector: SharedConnector<Conn>,
        cmd_rx: mpsc::Receiver<Request<Conn>>,
        evt_rx: mpsc::UnboundedReceiver<Event<Conn>>,
        evt_tx: mpsc::UnboundedSender<Event<Conn>>,
        now: Instant,
    ) -> Self {
        let codel = ControlledDelay::new(policy.queue_target, policy.queue_interval, now);
        Self {
            pool,
            policy,
            connector,
            mode: Mode::Busy,
            wait: TimeQueue::new(),
            ready: TimeQueue::new(),
            holders: HashMap::new(),
            codel,
            timers: TimerWheel::new(),
            poll_timer: 0,
            idle_timer: 0,
            next_holder: 0,
            cmd_rx,
            evt_rx,
            evt_tx,
        }
    }

    pub(crate) async fn run(mut self) {
        let now = Instant::now();
        self.arm_poll(now);
        self.arm_idle(now);
        loop {
            let wake = self.timers.next_due();
            tokio::select! {
                request = self.cmd_rx.recv() => match request {
                    Some(request) => self.on_request(Instant::now(), request),
                    None => return,
                },
                event = self.evt_rx.recv() => match event {
                    Some(event) => self.on_event(Instant::now(), event),
                    None => return,
                },
                () = sleep_until_due(wake) => self.on_timers(Instant::now()),
            }
        }
    }

    fn on_request(&mut self, now: Instant, request: Request<Conn>) {
        match request {
            Request::Checkout {
                pool,
                queue,
                submitted,
                token,
                deadline,
                reply,
            } => {
                if pool != self.pool {
                    let _ = reply.send(Err(Error::ForeignOwner));
                    return;
                }
                self.handle_checkout(queue, submitted, token, deadline, reply);
            }
            Request::Install { pool, conn, retire } => {
                if pool != self.pool {
                    warn!("refusing to install a connection from a foreign pool");
                    let _ = retire.send(Retire::Stop(anyhow::Error::new(Error::ForeignOwner)));
                    return;
                }
                self.handle_install(now, conn, retire);
            }
        }
    }

    fn on_event(&mut self, now: Instant, event: Event<Conn>) {
        match event {
            Event::Checkin { holder, conn } => self.handle_checkin(now, holder, conn),
            Event::Disconnect {
                holder,
                conn,
                cause,
            } => {
                drop(conn);
                self.teardown(holder, Retire::Respawn(cause));
            }
            Event::Stop {
                holder,
                conn,
                cause,
            } => {
                drop(conn);
                self.teardown(holder, Retire::Stop(cause));
            }
            Event::PingOk { holder, conn } => self.handle_ping_ok(now, holder, conn),
            Event::PingFailed { holder, cause } => {
                debug!(holder, %cause, "idle ping failed; disconnecting");
                self.teardown(holder, Retire::Respawn(anyhow::Error::new(cause)));
            }
            Event::CancelWait { key } => {
                self.wait.take(&key);
            }
        }
    }

    fn on_timers(&mut self, now: Instant) {
        while let Some((id, kind)) = self.timers.pop_due(now) {
            match kind {
                TimerKind::Deadline { holder } => self.handle_deadline(now, id, holder),
                TimerKind::Poll { cursor } => self.handle_poll(now, id, cursor),
                TimerKind::Idle { cursor } => self.handle_idle(now, id, cursor),
            }
        }
    }

    fn handle_checkout(
        &mut self,
        queue: bool,
        submitted: Instant,
        token: u64,
        deadline: Option<Instant>,
        reply: oneshot::Sender<Result<Handle<Conn>, Error>>,
    ) {
        let reply = match self.mode {
            Mode::Ready => match self.serve_from_ready(submitted, deadline, reply) {
                None => return,
                // The ready queue was exhausted by inconsistent holders;
                // fall through to the busy path.
                Some(reply) => reply,
            },
            Mode::Busy => reply,
        };

        if queue {
            self.wait.insert((submitted, token), Waiter { reply, deadline });
        } else {
            let _ = reply.send(Err(Error::Unavailable));
        }
    }

    /// Serve a checkout straight from the oldest idle connection. Returns
    /// the reply sender only if no usable idle connection was found.
    fn serve_from_ready(
        &mut self,
        submitted: Instant,
        deadline: Option<Instant>,
        reply: oneshot::Sender<Result<Handle<Conn>, Error>>,
    ) -> Option<oneshot::Sender<Result<Handle<Conn>, Error>>> {
        loop {
            let Some((key, id)) = self.ready.pop_first() else {
                self.mode = Mode::Busy;
                return Some(reply);
            };
            if self.ready.is_empty() {
                self.mode = Mode::Busy;
            }
            let Some(conn) = self.take_idle(id) else {
                continue;
            };
            return match self.hand_off(id, submitted, deadline, reply, conn) {
                Ok(()) => None,
                Err(conn) => {
                    // The requester vanished before the reply arrived.
                    // Put the holder back where it was.
                    let holder = self.holders.get_mut(&id).expect("holder seen in hand_off");
                    holder.state = HolderState::Idle(DebugIgnore(conn));
                    holder.ready_key = Some(key);
                    self.ready.insert(key, id);
                    self.mode = Mode::Ready;
                    None
                }
            };
        }
    }

    fn handle_install(&mut self, now: Instant, conn: Conn, retire: oneshot::Sender<Retire>) {
        let id = self.next_holder;
        self.next_holder += 1;
        self.holders.insert(
            id,
            Holder {
                // dispatch settles the real state below.
                state: HolderState::Detached,
                ready_key: None,
                retire,
            },
        );
        debug!(holder = id, "connection installed");
        self.dispatch(now, id, conn);
    }

    fn handle_checkin(&mut self, now: Instant, id: HolderId, conn: Conn) {
        let Some(holder) = self.holders.get(&id) else {
            // Torn down while the client held it (deadline fire, racing
            // disconnect). The connection is stale; discard it.
            debug!(holder = id, "discarding checkin for a destroyed holder");
            return;
        };
        if matches!(holder.state, HolderState::Claimed { .. }) {
            self.dispatch(now, id, conn);
        } else {
            warn!(holder = id, "checkin from a party that does not own the holder");
            drop(conn);
            self.teardown(id, Retire::Respawn(anyhow!("holder ownership diverged")));
        }
    }

    fn handle_ping_ok(&mut self, now: Instant, id: HolderId, conn: Conn) {
        let Some(holder) = self.holders.get(&id) else {
            debug!(holder = id, "pinged holder was destroyed in the meantime");
            return;
        };
        if matches!(holder.state, HolderState::Detached) {
            self.dispatch(now, id, conn);
        } else {
            warn!(holder = id, "ping completion for a holder that was not pinging");
            drop(conn);
            self.teardown(id, Retire::Respawn(anyhow!("holder ownership diverged")));
        }
    }

    /// Settle a connection back into the pool: pair it with the oldest
    /// waiter, or park it in the ready queue.
    fn dispatch(&mut self, now: Instant, id: HolderId, conn: Conn) {
        match self.mode {
            // No waiter can exist; park it. Reachable when an install
            // races checkouts that were served from other connections.
            Mode::Ready => self.to_ready(now, id, conn),
            Mode::Busy => self.dequeue(now, id, conn),
        }
    }

    /// CoDel-disciplined dequeue: serve the oldest waiter, shedding
    /// over-aged ones first while the queue is slow.
    fn dequeue(&mut self, now: Instant, id: HolderId, mut conn: Conn) {
        loop {
            if now >= self.codel.next_check() {
                let Some((head, _)) = self.wait.first_key() else {
                    return self.to_ready(now, id, conn);
                };
                if self.codel.begin_interval(now, now - head) {
                    debug!(
                        head_age_ms = (now - head).as_millis() as u64,
                        "wait queue over target; entering slow mode"
                    );
                }
            } else if self.codel.is_slow() {
                self.drop_slow(now);
            }

            let Some((key, waiter)) = self.wait.pop_first() else {
                return self.to_ready(now, id, conn);
            };
            let waited = now - key.0;
            match self.hand_off(id, key.0, waiter.deadline, waiter.reply, conn) {
                Ok(()) => {
                    self.codel.note_popped(waited);
                    return;
                }
                // The waiter died; reclaim the connection and try the
                // next one.
                Err(reclaimed) => conn = reclaimed,
            }
        }
    }

    /// Move the connection into a [Handle] and transfer it to the
    /// recipient. On failure the connection comes back to the caller and
    /// the holder is left detached.
    fn hand_off(
        &mut self,
        id: HolderId,
        since: Instant,
        deadline: Option<Instant>,
        reply: oneshot::Sender<Result<Handle<Conn>, Error>>,
        conn: Conn,
    ) -> Result<(), Conn> {
        let deadline_id = deadline.map(|at| self.timers.arm(at, TimerKind::Deadline { holder: id }));
        let Some(holder) = self.holders.get_mut(&id) else {
            warn!(holder = id, "holder vanished mid-transfer; dropping connection");
            return Ok(());
        };
        holder.state = HolderState::Claimed {
            deadline: deadline_id,
            since,
        };
        holder.ready_key = None;

        let handle = Handle::new(conn, id, deadline_id, self.pool, self.evt_tx.clone());
        match reply.send(Ok(handle)) {
            Ok(()) => Ok(()),
            Err(returned) => {
                let Ok(handle) = returned else {
                    unreachable!("an Ok reply was sent");
                };
                let conn = handle.dismantle();
                let holder = self.holders.get_mut(&id).expect("holder seen above");
                // The armed deadline dies by id mismatch once the state
                // moves on.
                holder.state = HolderState::Detached;
                Err(conn)
            }
        }
    }

    fn to_ready(&mut self, now: Instant, id: HolderId, conn: Conn) {
        let Some(holder) = self.holders.get_mut(&id) else {
            warn!(holder = id, "holder vanished before it could go idle; dropping connection");
            return;
        };
        holder.state = HolderState::Idle(DebugIgnore(conn));
        let key = (now, id);
        holder.ready_key = Some(key);
        self.ready.insert(key, id);
        self.codel.queue_cleared();
        self.mode = Mode::Ready;
    }

    /// Take the connection out of an idle holder. On ownership
    /// divergence the holder is destroyed and `None` returned.
    fn take_idle(&mut self, id: HolderId) -> Option<Conn> {
        let Some(holder) = self.holders.get_mut(&id) else {
            warn!(holder = id, "ready queue referenced a destroyed holder");
            return None;
        };
        match std::mem::replace(&mut holder.state, HolderState::Detached) {
            HolderState::Idle(DebugIgnore(conn)) => {
                holder.ready_key = None;
                Some(conn)
            }
            state => {
                holder.state = state;
                warn!(holder = id, "holder in ready queue was not idle; destroying");
                self.teardown(id, Retire::Respawn(anyhow!("holder ownership diverged")));
                None
            }
        }
    }

    /// Shed every waiter older than twice the target.
    fn drop_slow(&mut self, now: Instant) {
        let cutoff = now - self.codel.drop_threshold();
        let shed = self.wait.drain_older_than(cutoff);
        if shed.is_empty() {
            return;
        }
        debug!(count = shed.len(), "shedding over-aged waiters");
        for ((submitted, _), waiter) in shed {
            let waited = now - submitted;
            let _ = waiter.reply.send(Err(Error::Dropped { waited }));
        }
    }

    /// Destroy a holder and notify its worker. Safe to call with an id
    /// that was already destroyed.
    fn teardown(&mut self, id: HolderId, retire: Retire) {
        let Some(holder) = self.holders.remove(&id) else {
            return;
        };
        if let Some(key) = holder.ready_key {
            self.ready.take(&key);
            if self.ready.is_empty() {
                self.mode = Mode::Busy;
            }
        }
        let _ = holder.retire.send(retire);
    }

    fn handle_deadline(&mut self, now: Instant, timer: TimerId, id: HolderId) {
        let Some(holder) = self.holders.get(&id) else {
            return;
        };
        let HolderState::Claimed {
            deadline: Some(armed),
            since,
        } = &holder.state
        else {
            return;
        };
        if *armed != timer {
            // A later checkout re-armed the holder; this fire is stale.
            return;
        }
        let cause = Error::Timeout {
            elapsed: now - *since,
        };
        warn!(holder = id, %cause, "disconnecting an overdue checkout");
        self.teardown(id, Retire::Respawn(anyhow::Error::new(cause)));
    }

    fn arm_poll(&mut self, now: Instant) {
        let cursor = self.wait.first_key().map(|(at, _)| at).unwrap_or(now);
        self.poll_timer = self
            .timers
            .arm(now + self.policy.queue_interval, TimerKind::Poll { cursor });
    }

    fn handle_poll(&mut self, now: Instant, timer: TimerId, cursor: Instant) {
        if timer != self.poll_timer {
            return;
        }
        self.arm_poll(now);
        if self.mode != Mode::Busy {
            return;
        }
        let Some((submitted, _)) = self.wait.first_key() else {
            return;
        };
        if submitted > cursor {
            // The head moved since this poll was armed; the queue is
            // making progress.
            return;
        }
        let head_age = now - submitted;
        if self.codel.on_poll(now, head_age) {
            warn!(
                head_age_ms = head_age.as_millis() as u64,
                "wait queue stalled past target; shedding"
            );
            self.drop_slow(now);
        }
    }

    fn arm_idle(&mut self, now: Instant) {
        let cursor = self.ready.first_key().map(|(at, _)| at).unwrap_or(now);
        self.idle_timer = self
            .timers
            .arm(now + self.policy.idle_interval, TimerKind::Idle { cursor });
    }

    fn handle_idle(&mut self, now: Instant, timer: TimerId, cursor: Instant) {
        if timer != self.idle_timer {
            return;
        }
        self.arm_idle(now);
        if self.mode != Mode::Ready {
            return;
        }
        let Some((idle_since, _)) = self.ready.first_key() else {
            return;
        };
        if idle_since > cursor {
            // Checkouts have been cycling the queue since arming; no
            // connection has been idle long enough to need a ping.
            return;
        }
        let Some((_, id)) = self.ready.pop_first() else {
            return;
        };
        if self.ready.is_empty() {
            self.mode = Mode::Busy;
        }
        let Some(conn) = self.take_idle(id) else {
            return;
        };
        debug!(holder = id, "pinging the longest-idle connection");
        self.spawn_ping(id, conn);
    }

    fn spawn_ping(&mut self, id: HolderId, mut conn: Conn) {
        let connector = self.connector.clone();
        let events = self.evt_tx.clone();
        tokio::task::spawn(async move {
            match connector.is_valid(&mut conn).await {
                Ok(()) => {
                    let _ = events.send(Event::PingOk { holder: id, conn });
                }
                Err(cause) => {
                    drop(conn);
                    let _ = events.send(Event::PingFailed { holder: id, cause });
                }
            }
        });
    }

    #[cfg(test)]
    fn drain_events(&mut self, now: Instant) {
        while let Ok(event) = self.evt_rx.try_recv() {
            self.on_event(now, event);
        }
    }
}

async fn sleep_until_due(wake: Option<Instant>) {
    match wake {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
