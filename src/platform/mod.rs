//! Collaborator abstraction: traits for the external systems plus in-memory
//! implementations.

pub mod collaborators;
pub mod memory;
