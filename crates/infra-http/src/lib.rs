// Vouchers Infrastructure - HTTP Adapter (reqwest)
// Implements: UpstreamClient

mod client;

pub use client::{ClientError, ReqwestUpstream};
