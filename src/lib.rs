//! corral is a connection pooling crate.
//!
//! A corral multiplexes a bounded herd of persistent connections among
//! many concurrent clients. Checkouts are served first-come first-served,
//! and the wait queue runs a CoDel (Controlled Delay) discipline: when
//! even the best head-of-line delay stays above a target for a whole
//! measurement interval, the oldest waiters are shed instead of letting
//! every client time out at once.
//!
//! It uses the following terminology:
//! * A connection is checked *out* of the pool by a client and checked
//!   back *in* when the client is done with it.
//! * The broker is the task that pairs waiting checkouts with idle
//!   connections.
//! * A worker owns the lifecycle of one connection: it connects,
//!   publishes the connection to the broker, and reconnects when the
//!   connection is torn down.
//!
//! # Usage
//!
//! * The main interface for this crate is [pool::Pool].
//! * To construct a pool, you must supply a [connector::Connector], which
//!   specifies how connections to your backend are made and
//!   health-checked. [connectors::tcp::TcpConnector] is a minimal
//!   implementation for raw TCP backends.
//! * [pool::Pool::checkout] yields a [claim::Handle], which dereferences
//!   to the connection and checks it back in on drop.

// Public API
pub mod claim;
pub mod connector;
pub mod policy;
pub mod pool;

// Necessary for implementation
mod backoff;
mod broker;
mod codel;
mod queue;
#[cfg(test)]
mod test_utils;
mod worker;

// Default implementations of generic interfaces
pub mod connectors;
