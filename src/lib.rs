pub mod apps;
pub mod comfy;
pub mod config;
pub mod graph;
pub mod logger;
pub mod schema;
pub mod watcher;
