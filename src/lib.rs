pub mod blockchain;
pub mod config;
pub mod network;
pub mod node;
pub mod storage;
pub mod transaction;
pub mod wallet;
