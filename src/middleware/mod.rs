//! HTTP middleware

pub mod logging;

pub use logging::{request_logging_middleware, RequestId, REQUEST_ID_HEADER};
