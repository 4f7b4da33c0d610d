//! A channel-addressed message broker with HTTP long-poll delivery.
//!
//! Publishers `POST` to `/{channel}`; subscribers `GET` the same path with
//! `If-Modified-Since` / `If-None-Match` naming the last message they saw and
//! are parked until a newer one exists or the poll times out.

pub mod adapters;
pub mod client;
pub mod config;
pub mod core;
pub mod logging;
pub mod storage;
pub mod transport;

#[cfg(test)]
mod tests;
