#![allow(dead_code)]
//! Shared helpers for the test crates.

pub mod fixtures;
