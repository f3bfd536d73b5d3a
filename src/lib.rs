pub mod cli;
pub mod config;
pub mod db;
pub mod drivers;
pub mod engine;
pub mod global;
