//! TLS 1.3 client configuration with Encrypted Client Hello
//!
//! The ClientHello's SNI is encrypted under the relay host's published
//! ECH key set. Enabling ECH through rustls pins the connection to
//! TLS 1.3, and a server that rejects ECH (offering retry configs)
//! fails the handshake with an `ech_required` alert — there is no
//! silent fallback to the outer SNI identity. That hard failure is
//! load-bearing: the dialer treats it as a signal that the published
//! key set rotated and re-runs discovery.

use super::TransportError;
use rustls::client::{EchConfig, EchMode};
use rustls::crypto::aws_lc_rs;
use rustls::pki_types::EchConfigListBytes;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use tracing::debug;

/// Build a rustls client config that offers ECH with the given
/// `ECHConfigList` and trusts the system root store.
pub fn build_ech_client_config(ech_list: &[u8]) -> Result<ClientConfig, TransportError> {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        debug!(error = %err, "skipping unloadable system certificate");
    }
    let (added, _skipped) = roots.add_parsable_certificates(native.certs);
    if added == 0 {
        return Err(TransportError::Tls(
            "no usable certificates in the system root store".to_string(),
        ));
    }

    let ech_config = EchConfig::new(
        EchConfigListBytes::from(ech_list.to_vec()),
        aws_lc_rs::hpke::ALL_SUPPORTED_SUITES,
    )
    .map_err(|e| TransportError::Tls(format!("ECH config rejected: {}", e)))?;

    let config = ClientConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_ech(EchMode::from(ech_config))
        .map_err(|e| TransportError::Tls(format!("ECH mode: {}", e)))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(config)
}
