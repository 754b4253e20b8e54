//! The JSON-over-WebSocket frame language between clients and the broker.

pub mod messages;
