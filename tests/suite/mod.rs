//! Integration test modules

mod binary;
mod workflow;
