pub mod api;
pub mod cli;
pub mod engine;
pub mod governor;
pub mod pipeline;
pub mod storage;
