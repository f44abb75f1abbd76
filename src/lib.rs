pub mod agent;
pub mod config;
pub mod llm;
pub mod schema;
pub mod sql;
pub mod util;
pub mod web;
