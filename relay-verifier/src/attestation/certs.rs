// (c) The Relay Verifier Authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

//! Device certificate validation.
//!
//! A hardware relay ships a leaf certificate issued by one of the hardware
//! CAs held in Vault. The leaf is accepted when the issuer named by its
//! authority key id belongs to the hardware organization, its signature
//! checks out against that issuer, its serial is a well-formed ATEC serial,
//! and its SAN URI binds it to the relay fingerprint being verified.

use relay_events::Fingerprint;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::pem::parse_x509_pem;

use super::vault::IssuerLookup;

/// ATEC serials are nine bytes and carry the vendor prefix in the first two.
const ATEC_SERIAL_PREFIX: &str = "0123";

/// Subject organization every hardware CA is provisioned under. Vault can
/// hold issuers for other mounts, so the lookup alone does not vouch for
/// the CA.
const HARDWARE_CA_ORGANIZATION: &str = "Anon Hardware";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCertCheck {
    pub valid: bool,
    pub atec_serial: Option<String>,
}

impl DeviceCertCheck {
    fn invalid() -> Self {
        Self {
            valid: false,
            atec_serial: None,
        }
    }
}

#[derive(Debug)]
pub struct DeviceCertValidator<L> {
    issuers: L,
}

impl<L: IssuerLookup> DeviceCertValidator<L> {
    pub fn new(issuers: L) -> Self {
        Self { issuers }
    }

    #[tracing::instrument(level = "trace", skip_all)]
    pub async fn validate(
        &self,
        device_cert_pem: &str,
        fingerprint: &Fingerprint,
    ) -> DeviceCertCheck {
        let details = match device_cert_details(device_cert_pem) {
            Some(details) => details,
            None => {
                tracing::debug!(%fingerprint, "unreadable device certificate");
                return DeviceCertCheck::invalid();
            }
        };

        let issuer = match self
            .issuers
            .issuer_by_ski(&details.authority_key_id)
            .await
        {
            Some(issuer) => issuer,
            None => {
                tracing::debug!(
                    %fingerprint,
                    authority_key_id = %details.authority_key_id,
                    "no issuer matches the device certificate"
                );
                return DeviceCertCheck::invalid();
            }
        };

        if !has_hardware_organization(&issuer.certificate) {
            tracing::debug!(
                %fingerprint,
                issuer = %issuer.issuer_name,
                "issuer certificate is not from the hardware organization"
            );
            return DeviceCertCheck::invalid();
        }

        if !verify_issued_by(device_cert_pem, &issuer.certificate) {
            tracing::debug!(
                %fingerprint,
                issuer = %issuer.issuer_name,
                "device certificate failed issuer verification"
            );
            return DeviceCertCheck::invalid();
        }

        if !is_atec_serial(&details.serial) {
            tracing::debug!(
                %fingerprint,
                serial = %details.serial,
                "device certificate serial is not an ATEC serial"
            );
            return DeviceCertCheck::invalid();
        }

        if !matches_san_fingerprint(&details.san_uris, fingerprint) {
            tracing::debug!(
                %fingerprint,
                "device certificate SAN does not name the relay"
            );
            return DeviceCertCheck::invalid();
        }

        DeviceCertCheck {
            valid: true,
            atec_serial: Some(details.serial),
        }
    }
}

struct DeviceCertDetails {
    authority_key_id: String,
    serial: String,
    san_uris: Vec<String>,
}

fn device_cert_details(pem: &str) -> Option<DeviceCertDetails> {
    let (_, pem) = parse_x509_pem(pem.as_bytes()).ok()?;
    let cert = pem.parse_x509().ok()?;

    let mut authority_key_id: Option<String> = None;
    let mut san_uris = Vec::new();
    for extension in cert.extensions() {
        match extension.parsed_extension() {
            ParsedExtension::AuthorityKeyIdentifier(aki) => {
                authority_key_id =
                    aki.key_identifier.as_ref().map(|id| hex::encode(id.0));
            }
            ParsedExtension::SubjectAlternativeName(san) => {
                for name in &san.general_names {
                    if let GeneralName::URI(uri) = name {
                        san_uris.push((*uri).to_owned());
                    }
                }
            }
            _ => {}
        }
    }

    // DER integers are sign-padded; the serial itself never is.
    let raw = cert.raw_serial();
    let raw = if raw.len() > 1 && raw[0] == 0 {
        &raw[1..]
    } else {
        raw
    };

    Some(DeviceCertDetails {
        authority_key_id: authority_key_id?,
        serial: hex::encode_upper(raw),
        san_uris,
    })
}

fn has_hardware_organization(ca_pem: &str) -> bool {
    let (_, pem) = match parse_x509_pem(ca_pem.as_bytes()) {
        Ok(parsed) => parsed,
        Err(_) => return false,
    };
    let ca = match pem.parse_x509() {
        Ok(cert) => cert,
        Err(_) => return false,
    };
    let matches = ca.subject().iter_organization().any(|organization| {
        matches!(
            organization.as_str(),
            Ok(HARDWARE_CA_ORGANIZATION)
        )
    });
    matches
}

fn verify_issued_by(device_pem: &str, ca_pem: &str) -> bool {
    let (_, device_pem) = match parse_x509_pem(device_pem.as_bytes()) {
        Ok(parsed) => parsed,
        Err(_) => return false,
    };
    let device = match device_pem.parse_x509() {
        Ok(cert) => cert,
        Err(_) => return false,
    };
    let (_, ca_pem) = match parse_x509_pem(ca_pem.as_bytes()) {
        Ok(parsed) => parsed,
        Err(_) => return false,
    };
    let ca = match ca_pem.parse_x509() {
        Ok(cert) => cert,
        Err(_) => return false,
    };

    device.issuer().as_raw() == ca.subject().as_raw()
        && device.verify_signature(Some(ca.public_key())).is_ok()
}

fn is_atec_serial(serial: &str) -> bool {
    serial.len() == 18
        && serial.chars().all(|c| c.is_ascii_hexdigit())
        && serial[..4].eq_ignore_ascii_case(ATEC_SERIAL_PREFIX)
}

fn matches_san_fingerprint(uris: &[String], fingerprint: &Fingerprint) -> bool {
    let wanted = format!("anon://{}", fingerprint);
    uris.iter().any(|uri| uri.eq_ignore_ascii_case(&wanted))
}

#[cfg(test)]
mod tests {
    use super::super::vault::VaultIssuer;
    use super::*;
    use async_trait::async_trait;

    const CA_CERT: &str = include_str!("test_certs/ca.pem");
    const OTHER_CA_CERT: &str = include_str!("test_certs/other_ca.pem");
    const DEVICE_CERT: &str = include_str!("test_certs/device.pem");
    const DEVICE_CERT_BAD_SERIAL: &str =
        include_str!("test_certs/device_bad_serial.pem");
    const DEVICE_CERT_NO_SAN: &str =
        include_str!("test_certs/device_no_san.pem");
    const FOREIGN_ORG_CA_CERT: &str =
        include_str!("test_certs/foreign_org_ca.pem");
    const DEVICE_CERT_FOREIGN_ORG: &str =
        include_str!("test_certs/device_foreign_org.pem");

    const DEVICE_SN: &str = "0123FAE8C4E4FEB2D9";
    const DEVICE_SAN_FINGERPRINT: &str =
        "FFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFFF";
    const OTHER_FINGERPRINT: &str =
        "1111111111111111111111111111111111111111";

    #[derive(Debug)]
    struct StaticIssuers(Option<VaultIssuer>);

    #[async_trait]
    impl IssuerLookup for StaticIssuers {
        async fn issuer_by_ski(&self, _ski: &str) -> Option<VaultIssuer> {
            self.0.clone()
        }
    }

    fn issuer_with(certificate: &str) -> StaticIssuers {
        StaticIssuers(Some(VaultIssuer {
            ca_chain: vec![certificate.to_owned()],
            certificate: certificate.to_owned(),
            issuer_id: "11111111-2222-3333-4444-555555555555".to_owned(),
            issuer_name: "hardware-root".to_owned(),
            key_id: String::new(),
            revoked: false,
            usage: "issuing-certificates".to_owned(),
        }))
    }

    fn fingerprint() -> Fingerprint {
        DEVICE_SAN_FINGERPRINT.parse().unwrap()
    }

    #[tokio::test]
    async fn rejects_unreadable_device_certs() {
        let validator = DeviceCertValidator::new(issuer_with(CA_CERT));
        let check = validator.validate("bad-device-cert", &fingerprint()).await;
        assert!(!check.valid);
        assert_eq!(check.atec_serial, None);
    }

    #[tokio::test]
    async fn rejects_certs_with_no_matching_issuer() {
        let validator = DeviceCertValidator::new(StaticIssuers(None));
        let check = validator.validate(DEVICE_CERT, &fingerprint()).await;
        assert!(!check.valid);
    }

    #[tokio::test]
    async fn rejects_certs_signed_by_another_authority() {
        let validator = DeviceCertValidator::new(issuer_with(OTHER_CA_CERT));
        let check = validator.validate(DEVICE_CERT, &fingerprint()).await;
        assert!(!check.valid);
    }

    #[tokio::test]
    async fn rejects_cas_outside_the_hardware_organization() {
        // The foreign chain is otherwise sound: the signature verifies and
        // the leaf carries a proper ATEC serial and SAN fingerprint.
        let validator =
            DeviceCertValidator::new(issuer_with(FOREIGN_ORG_CA_CERT));
        let check = validator
            .validate(DEVICE_CERT_FOREIGN_ORG, &fingerprint())
            .await;
        assert!(!check.valid);
        assert_eq!(check.atec_serial, None);
    }

    #[tokio::test]
    async fn rejects_serials_without_the_vendor_prefix() {
        let validator = DeviceCertValidator::new(issuer_with(CA_CERT));
        let check = validator
            .validate(DEVICE_CERT_BAD_SERIAL, &fingerprint())
            .await;
        assert!(!check.valid);
    }

    #[tokio::test]
    async fn rejects_san_fingerprint_mismatches() {
        let validator = DeviceCertValidator::new(issuer_with(CA_CERT));
        let other: Fingerprint = OTHER_FINGERPRINT.parse().unwrap();
        let check = validator.validate(DEVICE_CERT, &other).await;
        assert!(!check.valid);

        let check = validator
            .validate(DEVICE_CERT_NO_SAN, &fingerprint())
            .await;
        assert!(!check.valid);
    }

    #[tokio::test]
    async fn accepts_certs_with_matching_issuer_serial_and_san() {
        let validator = DeviceCertValidator::new(issuer_with(CA_CERT));
        let check = validator.validate(DEVICE_CERT, &fingerprint()).await;
        assert!(check.valid);
        assert_eq!(check.atec_serial.as_deref(), Some(DEVICE_SN));
    }

    #[test]
    fn extracts_the_authority_key_id_as_bare_hex() {
        let details = device_cert_details(DEVICE_CERT).unwrap();
        assert_eq!(details.authority_key_id.len(), 40);
        assert!(details
            .authority_key_id
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(details.serial, DEVICE_SN);
    }

    #[test]
    fn atec_serials_need_the_vendor_prefix() {
        assert!(is_atec_serial("0123FAE8C4E4FEB2D9"));
        assert!(is_atec_serial("01237da6e721dcce01"));
        assert!(!is_atec_serial("FFFFFFFFFFFFFFFFFF"));
        assert!(!is_atec_serial("0123FAE8C4E4FEB2"));
        assert!(!is_atec_serial("0123FAE8C4E4FEB2XX"));
    }
}
