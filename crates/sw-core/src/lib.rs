pub mod completion;
pub mod config;
pub mod history;
pub mod types;
