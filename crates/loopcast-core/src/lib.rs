pub mod catalog;
pub mod clock;
pub mod config;
pub mod durations;
pub mod live;
pub mod platform;
pub mod protocol;
pub mod state;
