//! Integration and property test suite for Petal.
//!
//! Exercises the pools through their public APIs and several relay nodes
//! wired together in-process. Shared builders live in [`helpers`].

pub mod helpers;
