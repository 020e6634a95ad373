//! # Repositories
//!
//! One repository per table; each holds a cheap clone of the pool.

pub mod prices;
pub mod sales;
