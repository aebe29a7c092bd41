//! Network surface: HTTP endpoints, the viewer WebSocket and the wire
//! protocol.

mod connection;
mod error;
mod http;
pub mod protocol;

pub use error::ApiError;
pub use http::{
    build_router, AppState, CredentialInfo, HealthResponse, QrResponse, RedeemResponse,
    RefreshResponse, ServerInfo, SessionsResponse,
};
