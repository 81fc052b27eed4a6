use anyhow::{anyhow, Context, Result};
use chrono::{Datelike, Duration, Utc};
use rcgen::{CertificateParams, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Load a PEM pair when both paths are given, or mint a self-signed
/// certificate valid for `validity_days` when neither is.
pub fn load_or_generate_tls(
    cert_pem: Option<&str>,
    key_pem: Option<&str>,
    validity_days: u32,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    match (cert_pem, key_pem) {
        (Some(cert_path), Some(key_path)) => {
            let cert_pem = std::fs::read(cert_path).context("read cert PEM")?;
            let key_pem = std::fs::read(key_path).context("read key PEM")?;

            let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
                .collect::<Result<Vec<_>, _>>()
                .context("parse cert PEM")?;

            let key = rustls_pemfile::private_key(&mut &key_pem[..])
                .context("parse key PEM")?
                .ok_or_else(|| anyhow!("no private key found in PEM"))?;

            Ok((certs, key))
        }
        (None, None) => {
            let mut params = CertificateParams::new(vec!["localhost".to_string()])
                .context("certificate params")?;
            let now = Utc::now();
            let until = now + Duration::days(i64::from(validity_days));
            params.not_before = rcgen::date_time_ymd(now.year(), now.month() as u8, now.day() as u8);
            params.not_after =
                rcgen::date_time_ymd(until.year(), until.month() as u8, until.day() as u8);

            let key_pair = KeyPair::generate().context("generate key pair")?;
            let cert = params
                .self_signed(&key_pair)
                .context("failed generating self-signed cert")?;

            let cert_der: CertificateDer<'static> = cert.der().clone();
            let key_der = PrivateKeyDer::Pkcs8(key_pair.serialize_der().into());
            Ok((vec![cert_der], key_der))
        }
        _ => Err(anyhow!(
            "must set both --tls-cert-pem and --tls-key-pem, or neither"
        )),
    }
}
