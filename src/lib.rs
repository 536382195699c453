pub mod agent;
pub mod composer;
pub mod config;
pub mod database;
pub mod fleet;
pub mod llm;
pub mod pool;
pub mod proactive;
pub mod prompts;
pub mod surface;
