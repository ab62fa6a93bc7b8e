//! maildrift keeps a mail cluster's secondary in step with its primary.
//!
//! Change events from the primary land on the intake endpoint, collapse into
//! a per-user coalescing priority queue, and a worker pool replays them as
//! incremental dsync calls against the primary's admin API. A background
//! reconciler sweeps the full user list so every mailbox replicates within a
//! staleness bound even when no events arrive.

pub mod config;
pub mod cursor;
pub mod doveadm;
pub mod events;
pub mod handler;
pub mod metrics;
pub mod queue;
pub mod reconciler;
pub mod routes;
pub mod store;
pub mod worker;
