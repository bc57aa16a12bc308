pub mod browser;
pub mod category;
pub mod changeset;
pub mod config;
pub mod error;
pub mod protocol;
pub mod response;
pub mod runtime;
pub mod scheduler;
pub mod service;
pub mod source;
pub mod transform;
pub mod webhook;

#[cfg(test)]
pub(crate) mod testing;
