//! Client transport.

pub mod websocket;
