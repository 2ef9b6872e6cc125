pub mod batching;
pub mod bus;
pub mod cache;
pub mod cli;
pub mod config;
pub mod location;
pub mod pipeline;
pub mod storage;
pub mod web;
