//! Program front ends.

pub mod yaml;
