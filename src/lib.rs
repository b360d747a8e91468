//! Reservation manager for a cluster resource-management daemon.
//!
//! Administrators carve out time-windowed slices of cluster capacity —
//! whole nodes, per-node core subsets, or floating licenses — for the
//! exclusive or access-controlled use of designated accounts and users,
//! while ordinary scheduled work keeps running on the rest of the cluster.
//! The [`engine::Engine`] owns the authoritative reservation store;
//! node/partition/job tables mirror what the surrounding daemon knows, and
//! a versioned state file survives restarts.

pub mod assoc;
pub mod bitmap;
pub mod calendar;
pub mod cluster;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod state;
pub mod sweeper;
