//! Mach-O file format handling.
//!
//! This module provides types for parsing 64-bit Mach-O images and rewriting
//! their segment and section records in place.

mod constants;
mod context;
mod structs;

pub use constants::*;
pub use context::*;
pub use structs::*;
