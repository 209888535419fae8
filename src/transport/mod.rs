mod http_transport;
pub(crate) mod retry_policy;
pub mod websocket;

pub use http_transport::{body_stream, failure_from_reqwest, HttpTransport};
pub use websocket::{connect_socket, to_ws_url, WsStream};

use std::sync::Once;

static RUSTLS_PROVIDER_INIT: Once = Once::new();

/// Install the process-wide rustls crypto provider once.
///
/// Both the HTTP client and the WebSocket connector negotiate TLS through
/// rustls; the WebSocket side relies on the process default.
pub fn install_crypto_provider() {
    RUSTLS_PROVIDER_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
