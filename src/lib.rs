//! Engine for idempotent, dated snapshot backups of remote accounts.
//!
//! A backup of one account on one service for one calendar day is a *snapshot*. The
//! [`SnapshotOrchestrator`](orchestrator::SnapshotOrchestrator) runs it around a
//! [`Connector`](connector::Connector):
//!
//! 1. [`guard`]: skip the run if the day's manifest already reports it done.
//! 2. list the remote items and put them in a stable [`order`].
//! 3. fetch each item under the [`retry`] policy into the deduplicating [`store`].
//! 4. persist the outcome as a [`manifest`].
//!
//! Running the same request twice against unchanged remote data yields the same
//! manifest, and no item is ever written twice for one account.

#![forbid(unsafe_code)]

pub mod cli;
pub mod config;
pub mod connector;
pub mod guard;
pub mod layout;
pub mod manifest;
pub mod model;
pub mod orchestrator;
pub mod order;
pub mod retry;
pub mod store;
pub mod util;
