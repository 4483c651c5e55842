//! HTTP API Module
//!
//! Provides a REST API for backend management and SQL over HTTP.

mod http;

pub use http::{
    ActivateResponse, AppState, BackendDetail, BackendHealth, DeactivateResponse, ErrorResponse,
    HealthResponse, HttpServer, ResyncRequest, SqlRequest, SqlResponse, StatusResponse,
};
