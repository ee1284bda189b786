//! Multi-protocol live media server.
//!
//! Publishers feed named paths over RTSP(S), RTMP(S), SRT or WebRTC-WHIP;
//! readers consume them over the same protocols plus HLS. The crate is the
//! concurrency and routing fabric around those wire layers: per-path
//! actors, one-to-many stream fan-out with per-reader backpressure, uniform
//! connection registries, and diff-driven configuration reload.

pub mod api;
pub mod auth;
pub mod conf;
pub mod confwatcher;
pub mod core;
pub mod externalcmd;
pub mod metrics;
pub mod path;
pub mod servers;
pub mod stream;
pub mod tls;
