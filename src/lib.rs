pub mod bounds_cache;
pub mod build;
pub mod cache;
pub mod colormap;
pub mod config;
pub mod dataset;
pub mod descriptor;
pub mod error;
pub mod events;
pub mod pool;
pub mod settings;
pub mod tasks {
    pub mod player;
    pub mod presenter;
    pub mod watch;
}
