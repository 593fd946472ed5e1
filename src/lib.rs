pub mod batch;
pub mod cli;
pub mod config;
pub mod progress;
pub mod reconcile;
pub mod storage;
pub mod web;
