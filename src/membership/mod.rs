//! Membership Module
//!
//! Keeps the grid view: which nodes are members, in which order they joined
//! and whether they are still heard from. The oldest member of the view is
//! the coordinator.
//!
//! ## Core Mechanisms
//! - **Join order**: every join takes a new incarnation number; a node that
//!   rejoins goes to the back of the line.
//! - **Failure detection**: members that stop signalling liveness move from
//!   `Alive` to `Suspect` to `Dead`. Dead members drop out of the view, which
//!   may elect a new coordinator.

pub mod service;
pub mod types;
