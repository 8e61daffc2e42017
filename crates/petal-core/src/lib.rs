//! # petal-core
//! Foundation types, constants, errors, and trait seams shared by the
//! Petal transaction pool crates.

pub mod constants;
pub mod error;
pub mod traits;
pub mod types;
