//! State Management Module
//!
//! Tracks the followers of a serving node.

mod peers;

pub use peers::{PeerState, PeerStatus, PeerSummary, PeerTracker};
