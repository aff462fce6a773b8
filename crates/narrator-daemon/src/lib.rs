pub mod alignment;
pub mod audio;
pub mod bridge;
pub mod cache;
pub mod capability;
pub mod config;
pub mod package;
pub mod service;
pub mod stream;
pub mod synth;
pub mod text;
pub mod tts;
pub mod workers;
