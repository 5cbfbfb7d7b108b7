use std::sync::Once;

static CRYPTO_PROVIDER: Once = Once::new();

/// Install the ring crypto provider for rustls, once per process.
///
/// Both the token client and `wss://` transports need a process-wide
/// provider. If the host application already installed one, that one wins.
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("A rustls crypto provider was already installed");
        }
    });
}
