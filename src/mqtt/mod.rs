pub mod client;

/// Ask the monitor to publish a fresh reading.
#[derive(Debug, Clone, Copy)]
pub struct RequestData;

/// Payload published on the command topic to trigger a reading.
pub const REQUEST_PAYLOAD: &str = r#"{"params":"appActive"}"#;
