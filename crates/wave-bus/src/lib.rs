//! Redis-backed coordination for the WAVE orchestrator.
//!
//! Two planes share one Redis:
//!
//! - the **task queue** ([`queue`], [`supervisor`]): per-domain FIFO
//!   lists that distribute work units to agent workers and collect
//!   their results;
//! - the **signal bus** ([`publisher`], [`subscriber`], [`dispatcher`]):
//!   project-namespaced streams consumed through consumer groups, with
//!   a dead-letter channel for failed handlers and a
//!   [`result_waiter::ResultWaiter`] latch that replaces poll loops.

pub mod channels;
pub mod client;
pub mod dispatcher;
pub mod publisher;
pub mod queue;
pub mod result_waiter;
pub mod subscriber;
pub mod supervisor;
pub mod types;
