mod requests_logging;
mod security_headers;

pub use requests_logging::log_requests;
pub use security_headers::security_headers;
