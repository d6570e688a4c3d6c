/// Config module - persisted key/value configuration store

pub mod json_config;

pub use json_config::JsonConfig;
