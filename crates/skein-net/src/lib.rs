//! # skein-net
//!
//! Integration-test harness for a message-routing network. Builds a
//! topology of router and client (sender/receiver) processes, starts and
//! stops them as independent OS processes, and verifies structural and
//! behavioral properties of the running network.
//!
//! The routers and clients themselves are black boxes: the harness talks
//! to them only through generated config files, process arguments, and
//! marker files in a shared events directory.
//!
//! ## Crate structure
//!
//! - [`process`] — child-process supervisor (spawn, halt race, restart)
//! - [`version`] — named router-installation registry
//! - [`ports`] — ephemeral port allocation
//! - [`router`] — router node model and config generation
//! - [`client`] — sender/receiver node model
//! - [`topology`] — node collections, topology builders, connectivity
//! - [`events`] — completion watcher over marker files
//! - [`network`] — the orchestrator composing all of the above
//! - [`paths`] — session directory layout

pub mod client;
pub mod events;
pub mod network;
pub mod paths;
pub mod ports;
pub mod process;
pub mod router;
pub mod topology;
pub mod version;
