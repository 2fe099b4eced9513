#![forbid(unsafe_code)]
//! Hashing, filesystem, process, and HTTP helpers for Gantry.

pub mod error;
pub mod fs;
pub mod hash;
pub mod http;
pub mod process;
