use axum_server::tls_rustls::RustlsConfig;
use std::path::PathBuf;

/// Loads a PEM certificate chain and private key for serving over TLS.
pub async fn configure_tls(
    cert_path: PathBuf,
    key_path: PathBuf,
) -> anyhow::Result<RustlsConfig> {
    RustlsConfig::from_pem_file(&cert_path, &key_path)
        .await
        .map_err(|e| {
            anyhow::anyhow!("failed to load TLS material from {}: {e}", cert_path.display())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_files_are_reported_with_their_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = configure_tls(dir.path().join("cert.pem"), dir.path().join("key.pem"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cert.pem"));
    }
}
