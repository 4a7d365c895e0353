// src/common/mod.rs

pub mod config;
pub mod error;
