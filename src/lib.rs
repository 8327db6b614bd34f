pub mod assembler;
pub mod batch;
pub mod cache;
pub mod config;
pub mod data;
pub mod errors;
pub mod etl;
pub mod pending;
pub mod pipeline;
pub mod remote;
pub mod resolver;
pub mod sink;
