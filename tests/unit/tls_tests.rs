/* httpctl (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

use std::{fs, path::Path, sync::Arc, time::SystemTime};

use httpctl::config::TlsConfig;
use httpctl::tls::{issue_leaf, terminate, CertificateAuthority, KeyAlgorithm, RootCredential};
use httpctl::utils::{CaError, IssuanceError};
use rcgen::{BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};
use rustls::crypto::aws_lc_rs;
use rustls::pki_types::ServerName;
use rsa::pkcs8::EncodePrivateKey;
use tempfile::tempdir;
use tokio_rustls::TlsConnector;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::parse_x509_certificate;

fn root_params(alg: &'static rcgen::SignatureAlgorithm) -> CertificateParams {
    let mut params = CertificateParams::new(Vec::new());
    params.alg = alg;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "httpctl test root");
    dn.push(DnType::CommonName, "httpctl test root");
    params.distinguished_name = dn;
    params
}

fn write_root(dir: &Path, params: CertificateParams) {
    let root = Certificate::from_params(params).expect("root certificate");
    fs::write(dir.join("rootCA.pem"), root.serialize_pem().expect("cert pem")).expect("write cert");
    fs::write(dir.join("rootCA-key.pem"), root.serialize_private_key_pem()).expect("write key");
}

fn write_p256_root(dir: &Path) {
    write_root(dir, root_params(&rcgen::PKCS_ECDSA_P256_SHA256));
}

fn write_rsa_root(dir: &Path) {
    let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("rsa key");
    let der = key.to_pkcs8_der().expect("pkcs8");
    let mut params = root_params(&rcgen::PKCS_RSA_SHA256);
    params.key_pair = Some(KeyPair::from_der(der.as_bytes()).expect("rcgen key pair"));
    write_root(dir, params);
}

fn tls_config(dir: &Path) -> TlsConfig {
    TlsConfig {
        caroot: Some(dir.to_path_buf()),
        issuance_timeout_ms: 60_000,
        ..TlsConfig::default()
    }
}

#[test]
fn p256_root_issues_verifiable_p256_leaf() {
    let dir = tempdir().expect("tempdir");
    write_p256_root(dir.path());
    let root = RootCredential::load_from_caroot(dir.path()).expect("root loads");
    assert_eq!(root.leaf_algorithm(), Some(KeyAlgorithm::EcdsaP256));

    let leaf = issue_leaf(&root, "shop.example.com").expect("leaf issued");
    assert_eq!(leaf.algorithm, KeyAlgorithm::EcdsaP256);
    assert_eq!(leaf.chain.len(), 2);

    let (_, cert) = parse_x509_certificate(leaf.chain[0].as_ref()).expect("leaf parses");
    let (_, ca) = parse_x509_certificate(root.certificate().as_ref()).expect("root parses");
    cert.verify_signature(Some(ca.public_key()))
        .expect("leaf signed by root");

    let san = cert
        .subject_alternative_name()
        .expect("san extension parses")
        .expect("san present");
    assert_eq!(san.value.general_names, vec![GeneralName::DNSName("shop.example.com")]);

    let organization = cert
        .subject()
        .iter_organization()
        .next()
        .and_then(|attr| attr.as_str().ok());
    assert_eq!(organization, Some("Foddler MITM proxy Inc"));
    assert!(cert.validity().is_valid());
    assert!(leaf.not_before <= SystemTime::now() && SystemTime::now() <= leaf.not_after);
}

#[test]
fn leaf_keys_are_reproducible_per_host_but_serials_are_not() {
    let dir = tempdir().expect("tempdir");
    write_p256_root(dir.path());
    let root = RootCredential::load_from_caroot(dir.path()).expect("root loads");

    let first = issue_leaf(&root, "a.example").expect("first");
    let second = issue_leaf(&root, "a.example").expect("second");
    let other = issue_leaf(&root, "b.example").expect("other host");

    assert_eq!(first.key_der, second.key_der);
    assert_ne!(first.key_der, other.key_der);
    assert_ne!(first.serial, second.serial);
}

#[test]
fn ip_hosts_get_ip_san() {
    let dir = tempdir().expect("tempdir");
    write_p256_root(dir.path());
    let root = RootCredential::load_from_caroot(dir.path()).expect("root loads");

    let leaf = issue_leaf(&root, "127.0.0.1").expect("leaf issued");
    let (_, cert) = parse_x509_certificate(leaf.chain[0].as_ref()).expect("leaf parses");
    let san = cert
        .subject_alternative_name()
        .expect("san extension parses")
        .expect("san present");
    assert_eq!(san.value.general_names, vec![GeneralName::IPAddress(&[127, 0, 0, 1])]);
}

#[test]
fn rsa_root_issues_rsa_leaf() {
    let dir = tempdir().expect("tempdir");
    write_rsa_root(dir.path());
    let root = RootCredential::load_from_caroot(dir.path()).expect("root loads");
    assert_eq!(root.leaf_algorithm(), Some(KeyAlgorithm::Rsa));

    let leaf = issue_leaf(&root, "rsa.example").expect("leaf issued");
    let (_, cert) = parse_x509_certificate(leaf.chain[0].as_ref()).expect("leaf parses");
    let (_, ca) = parse_x509_certificate(root.certificate().as_ref()).expect("root parses");
    cert.verify_signature(Some(ca.public_key()))
        .expect("leaf signed by root");
    assert_eq!(leaf.algorithm, KeyAlgorithm::Rsa);
}

#[test]
fn ed25519_root_loads_but_cannot_issue() {
    let dir = tempdir().expect("tempdir");
    write_root(dir.path(), root_params(&rcgen::PKCS_ED25519));
    let root = RootCredential::load_from_caroot(dir.path()).expect("root loads");
    assert_eq!(root.leaf_algorithm(), None);

    let err = issue_leaf(&root, "example.com").unwrap_err();
    assert!(matches!(err, IssuanceError::UnsupportedKeyType(_)));
}

#[test]
fn missing_root_is_a_read_failure() {
    let dir = tempdir().expect("tempdir");
    let err = CertificateAuthority::from_config(&tls_config(dir.path())).unwrap_err();
    assert!(matches!(err, CaError::ReadFailure(_)));
}

#[test]
fn swapped_pem_blocks_are_a_parse_failure() {
    let dir = tempdir().expect("tempdir");
    write_p256_root(dir.path());
    let cert = fs::read(dir.path().join("rootCA.pem")).expect("cert");
    let key = fs::read(dir.path().join("rootCA-key.pem")).expect("key");
    fs::write(dir.path().join("rootCA.pem"), key).expect("swap");
    fs::write(dir.path().join("rootCA-key.pem"), cert).expect("swap");

    let err = RootCredential::load_from_caroot(dir.path()).unwrap_err();
    assert!(matches!(err, CaError::ParseFailure(_)));
}

#[tokio::test]
async fn concurrent_handshake_lookups_share_one_issuance() {
    let dir = tempdir().expect("tempdir");
    write_p256_root(dir.path());
    let ca = Arc::new(CertificateAuthority::from_config(&tls_config(dir.path())).expect("ca"));

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let ca = ca.clone();
            let sni = if i % 2 == 0 { "Example.COM" } else { "example.com:443" };
            tokio::spawn(async move { ca.get_certificate(sni).await })
        })
        .collect();

    let mut leaves = Vec::new();
    for task in tasks {
        leaves.push(task.await.expect("join").expect("leaf"));
    }
    assert!(leaves.iter().all(|leaf| Arc::ptr_eq(leaf, &leaves[0])));
    assert_eq!(leaves[0].host, "example.com");

    let metrics = ca.cache_metrics();
    assert_eq!(metrics.generated, 1);
    assert_eq!(ca.cached_leaves(), 1);
}

#[tokio::test]
async fn terminated_handshake_serves_leaf_for_sni_and_negotiates_h2() {
    let dir = tempdir().expect("tempdir");
    write_p256_root(dir.path());
    let ca = CertificateAuthority::from_config(&tls_config(dir.path())).expect("ca");

    let mut roots = rustls::RootCertStore::empty();
    roots.add(ca.root().certificate().clone()).expect("trust root");
    let mut client_cfg = rustls::ClientConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .expect("versions")
        .with_root_certificates(roots)
        .with_no_client_auth();
    client_cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    let connector = TlsConnector::from(Arc::new(client_cfg));

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = async { terminate(&ca, server_io, None).await };
    let client = async {
        let name = ServerName::try_from("api.example.test").expect("server name");
        connector.connect(name, client_io).await
    };
    let (server, client) = tokio::join!(server, client);

    let terminated = server.expect("server handshake");
    client.expect("client trusts the issued leaf");
    assert_eq!(terminated.sni.as_deref(), Some("api.example.test"));
    assert!(terminated.negotiated_h2());
    assert_eq!(ca.cached_leaves(), 1);
}

#[tokio::test]
async fn ip_literal_without_sni_gets_leaf_for_connect_target() {
    let dir = tempdir().expect("tempdir");
    write_p256_root(dir.path());
    let ca = CertificateAuthority::from_config(&tls_config(dir.path())).expect("ca");

    let mut roots = rustls::RootCertStore::empty();
    roots.add(ca.root().certificate().clone()).expect("trust root");
    let client_cfg = rustls::ClientConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .expect("versions")
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(client_cfg));

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = async { terminate(&ca, server_io, Some("127.0.0.1:443")).await };
    let client = async {
        let name = ServerName::try_from("127.0.0.1").expect("ip server name");
        connector.connect(name, client_io).await
    };
    let (server, client) = tokio::join!(server, client);

    let terminated = server.expect("server handshake");
    client.expect("client accepts the IP SAN");
    assert_eq!(terminated.sni, None);
    assert_eq!(ca.cached_leaves(), 1);
}
