//! Infrastructure layer: transport endpoint and configuration persistence.

pub mod network;
pub mod storage;
