//! Optional TLS configuration.

use axum_server::tls_rustls::RustlsConfig;
use std::io;
use tracing::info;

use crate::config::Args;

/// Loads the PEM pair when both `--tls-cert` and `--tls-key` are given.
pub async fn load_rustls_config(args: &Args) -> io::Result<Option<RustlsConfig>> {
    match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => {
            let config = RustlsConfig::from_pem_file(cert, key).await?;
            info!(cert, "loaded tls certificate");
            Ok(Some(config))
        }
        (None, None) => Ok(None),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "--tls-cert and --tls-key must be given together",
        )),
    }
}
