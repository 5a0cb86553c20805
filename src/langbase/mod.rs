//! Langbase Pipes API client.
//!
//! Every research agent and pipe-backed literature/analysis backend is a
//! Langbase pipe called through [`LangbaseClient::call_pipe`].

mod client;
mod types;

pub use client::LangbaseClient;
pub use types::*;
