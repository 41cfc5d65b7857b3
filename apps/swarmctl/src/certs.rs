use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use rcgen::{date_time_ymd, CertificateParams, DistinguishedName, DnType, KeyPair};
use serde::Serialize;

use crate::credentials::Secret;
use crate::util::shell_quote;

pub const CERT_DIR: &str = "/etc/ssl/piswarm";
pub const SELF_SIGNED_FALLBACK_DOMAIN: &str = "piswarm.local";

/// PEM material for the run's self-signed wildcard certificate.
#[derive(Debug, Clone)]
pub struct CertificateBundle {
    pub cert_pem: String,
    pub key_pem: Secret,
    pub subject_alt_names: Vec<String>,
    pub not_after: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LetsEncryptRequest {
    pub domain: String,
    pub email: String,
}

/// Issuance is attempted only when both a domain and an email are present.
pub fn letsencrypt_request(
    domain: Option<&str>,
    email: Option<&str>,
) -> Option<LetsEncryptRequest> {
    let domain = domain.map(str::trim).filter(|v| !v.is_empty())?;
    let email = email.map(str::trim).filter(|v| !v.is_empty())?;
    Some(LetsEncryptRequest {
        domain: domain.to_string(),
        email: email.to_string(),
    })
}

pub fn certificate_paths(name: &str) -> (String, String) {
    (
        format!("{CERT_DIR}/{name}.crt"),
        format!("{CERT_DIR}/{name}.key"),
    )
}

/// File stem for the installed certificate: explicit name, else the domain,
/// else `piswarm`. Characters unsafe in a file name become `_`.
pub fn certificate_name(name: Option<&str>, domain: Option<&str>) -> String {
    let raw = name
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| domain.map(str::trim).filter(|v| !v.is_empty()))
        .unwrap_or("piswarm");
    let cleaned: String = raw
        .trim_start_matches("*.")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "piswarm".to_string()
    } else {
        cleaned
    }
}

pub fn certbot_command(request: &LetsEncryptRequest) -> String {
    format!(
        "(command -v certbot >/dev/null 2>&1 \
          || (apt-get update && DEBIAN_FRONTEND=noninteractive apt-get install -y certbot)) \
          && certbot certonly --standalone --non-interactive --agree-tos \
          --keep-until-expiring --email {} -d {}",
        shell_quote(&request.email),
        shell_quote(&request.domain),
    )
}

pub fn link_letsencrypt_command(request: &LetsEncryptRequest, name: &str) -> String {
    let (crt, key) = certificate_paths(name);
    let live = format!("/etc/letsencrypt/live/{}", request.domain);
    format!(
        "install -d -m 755 {CERT_DIR} \
          && ln -sf {} {} \
          && ln -sf {} {}",
        shell_quote(&format!("{live}/fullchain.pem")),
        shell_quote(&crt),
        shell_quote(&format!("{live}/privkey.pem")),
        shell_quote(&key),
    )
}

/// Generates a self-signed certificate covering `domain` and `*.domain`.
pub fn generate_self_signed(
    domain: &str,
    validity_days: u32,
) -> Result<CertificateBundle, rcgen::Error> {
    let domain = domain.trim().trim_start_matches("*.");
    let domain = if domain.is_empty() {
        SELF_SIGNED_FALLBACK_DOMAIN
    } else {
        domain
    };
    let subject_alt_names = vec![domain.to_string(), format!("*.{domain}")];

    let mut params = CertificateParams::new(subject_alt_names.clone())?;
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, format!("*.{domain}"));
    name.push(DnType::OrganizationName, "Pi-Swarm");
    params.distinguished_name = name;

    let today = Utc::now().date_naive();
    let not_after = today + ChronoDuration::days(i64::from(validity_days.max(1)));
    params.not_before = date_time_ymd(today.year(), today.month() as u8, today.day() as u8);
    params.not_after = date_time_ymd(
        not_after.year(),
        not_after.month() as u8,
        not_after.day() as u8,
    );

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;
    Ok(CertificateBundle {
        cert_pem: cert.pem(),
        key_pem: Secret::new(key_pair.serialize_pem()),
        subject_alt_names,
        not_after,
    })
}
