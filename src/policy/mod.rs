//! Policy model: the tree (C3) and its document parser/validator (C4).
//!
//! - `tree` — node types, ancestry, effective-ACL and effective-constraint derivation.
//! - `document` — strict schema validation turning a document into a `PolicyTree` or
//!   a structured `Issue` list.

pub mod document;
pub mod tree;

pub use tree::{Constraint, Environment, Group, PolicyTree, Privilege, System, TypedVariable};
