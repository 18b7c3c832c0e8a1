//! Real-time multi-party messaging where every recipient reads each message
//! in their own language.

pub mod auth;
pub mod channels;
pub mod cloud_translate;
pub mod config;
pub mod directory;
pub mod error;
pub mod fanout;
pub mod i18n;
pub mod media;
pub mod models;
pub mod openai;
pub mod opus_mt;
pub mod retry;
pub mod server;
pub mod store;
pub mod translation;
pub mod ws;
