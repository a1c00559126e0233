mod common;

use chrono::Duration;
use common::{assert_signed_by, csr, csr_with_cn, TestEnv, LOCAL};
use mwca_core::caller::CallerIdentity;
use mwca_core::csr_types::{CertificateIssuer, CertificateStatus, RequestStatus};
use mwca_core::error::{CaError, RedeemError};
use mwca_server::CaService;
use serde_json::json;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

#[test]
fn generated_root_has_ca_profile() {
    use mwca_server::infrastructure::key_material::{CA_CERT_FILE, CA_KEY_FILE};
    use x509_parser::prelude::{FromDer, X509Certificate};
    use x509_parser::public_key::PublicKey;

    let dir = common::shared_ca_dir();
    let pem = std::fs::read_to_string(dir.join(CA_CERT_FILE)).unwrap();
    let der = mwca_core::utils::pem_to_der(&pem, "CERTIFICATE").unwrap();
    let (_, cert) = X509Certificate::from_der(&der).unwrap();

    let bc = cert.basic_constraints().unwrap().expect("basicConstraints");
    assert!(bc.critical);
    assert!(bc.value.ca);
    assert_eq!(bc.value.path_len_constraint, Some(0));

    let ku = cert.key_usage().unwrap().expect("keyUsage");
    assert!(ku.critical);
    assert!(ku.value.key_cert_sign());
    assert!(ku.value.crl_sign());
    assert!(!ku.value.digital_signature());
    assert!(!ku.value.key_encipherment());

    let validity = cert.validity();
    let days = (validity.not_after.timestamp() - validity.not_before.timestamp()) / 86_400;
    assert_eq!(days, 3650);

    match cert.public_key().parsed().unwrap() {
        PublicKey::RSA(rsa) => {
            assert!(rsa.key_size() >= 4096, "key size {}", rsa.key_size());
            assert_eq!(rsa.try_exponent().unwrap(), 65_537);
        }
        other => panic!("CA key is not RSA: {other:?}"),
    }

    let subject = cert.subject().to_string();
    assert!(subject.contains("CN=MwAgent Root CA"), "{subject}");
    assert!(subject.contains("C=KR"), "{subject}");
    cert.verify_signature(None).unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = |name: &str| {
            std::fs::metadata(dir.join(name)).unwrap().permissions().mode() & 0o777
        };
        assert_eq!(mode(CA_KEY_FILE), 0o600);
        assert_eq!(mode(CA_CERT_FILE), 0o644);
    }
}

async fn issue_token(service: &CaService, cn: Option<&str>) -> String {
    service
        .issue_bootstrap_token(cn.map(str::to_string), Some(24), None, "test", "ops")
        .await
        .unwrap()
        .token_id
        .as_str()
        .to_string()
}

#[tokio::test]
async fn approve_flow_issues_90_day_certificate() {
    let env = TestEnv::new();
    let service = env.open().await;

    let token = issue_token(&service, Some("host1_alice_J")).await;
    let request_id = service
        .submit_certificate_request(
            &csr("host1", "alice"),
            &token,
            LOCAL,
            json!({"hostname": "host1", "version": "1.4.2"}),
        )
        .await
        .unwrap();

    let pending = service.list_pending_requests().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].request_id, request_id);
    assert_eq!(pending[0].subject.hostname, "host1");
    assert_eq!(pending[0].subject.username, "alice");

    let issued = service
        .approve_request(&request_id, "admin", Some(90), "looks good")
        .await
        .unwrap();
    assert_eq!(issued.subject_common_name, "host1_alice_J");
    assert_eq!(issued.expires_at - issued.issued_at, Duration::days(90));
    assert_eq!(issued.issuer, CertificateIssuer::Request(request_id.clone()));

    let view = service.get_certificate_request_status(&request_id).await.unwrap();
    assert_eq!(view.status, RequestStatus::Approved);
    assert_eq!(view.approved_by.as_deref(), Some("admin"));
    let cert_pem = view.certificate_pem.expect("certificate");
    let ca_pem = view.ca_certificate_pem.expect("ca certificate");
    assert_eq!(ca_pem, service.get_ca_certificate());
    assert_signed_by(&cert_pem, service.get_ca_certificate());

    assert!(service.list_pending_requests().await.unwrap().is_empty());
    let listed = service.list_issued_certificates(Some(CertificateStatus::Active)).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].serial_number, issued.serial_number);
}

#[tokio::test]
async fn expected_cn_mismatch_creates_no_request() {
    let env = TestEnv::new();
    let service = env.open().await;

    let token = issue_token(&service, Some("host1_bob_J")).await;
    let err = service
        .submit_certificate_request(&csr("host1", "alice"), &token, LOCAL, json!(null))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CaError::Token(RedeemError::SubjectMismatch { .. })
    ));
    assert!(service.list_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn reused_token_fails_and_creates_no_request() {
    let env = TestEnv::new();
    let service = env.open().await;

    let token = issue_token(&service, None).await;
    service
        .submit_certificate_request(&csr("host1", "alice"), &token, LOCAL, json!(null))
        .await
        .unwrap();

    let err = service
        .submit_certificate_request(&csr("host2", "carol"), &token, LOCAL, json!(null))
        .await
        .unwrap_err();
    assert!(matches!(err, CaError::Token(RedeemError::AlreadyUsed)));
    assert_eq!(service.list_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn expired_token_always_fails() {
    let env = TestEnv::new();
    let service = env.open().await;

    let token = service
        .issue_bootstrap_token(None, Some(0), None, "", "ops")
        .await
        .unwrap();
    for _ in 0..2 {
        let err = service
            .submit_certificate_request(
                &csr("host1", "alice"),
                token.token_id.as_str(),
                LOCAL,
                json!(null),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CaError::Token(RedeemError::Expired)));
    }
    assert!(service.list_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn source_address_restriction() {
    let env = TestEnv::new();
    let service = env.open().await;

    let allowed = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));
    let token = service
        .issue_bootstrap_token(None, None, Some(BTreeSet::from([allowed])), "", "ops")
        .await
        .unwrap();

    let err = service
        .submit_certificate_request(&csr("host1", "alice"), token.token_id.as_str(), LOCAL, json!(null))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CaError::Token(RedeemError::SourceNotAllowed { .. })
    ));

    service
        .submit_certificate_request(&csr("host1", "alice"), token.token_id.as_str(), allowed, json!(null))
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_concurrent_redeemer_wins() {
    let env = TestEnv::new();
    let service = Arc::new(env.open().await);
    let token = issue_token(&service, None).await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let service = service.clone();
        let token = token.clone();
        let csr = csr(&format!("host{i}"), "alice");
        handles.push(tokio::spawn(async move {
            service
                .submit_certificate_request(&csr, &token, LOCAL, json!(null))
                .await
        }));
    }

    let mut won = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => won += 1,
            Err(CaError::Token(RedeemError::AlreadyUsed)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(service.list_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn approve_and_reject_transition_once() {
    let env = TestEnv::new();
    let service = env.open().await;

    let approved_id = {
        let token = issue_token(&service, None).await;
        service
            .submit_certificate_request(&csr("host1", "alice"), &token, LOCAL, json!(null))
            .await
            .unwrap()
    };
    let rejected_id = {
        let token = issue_token(&service, None).await;
        service
            .submit_certificate_request(&csr("host2", "bob"), &token, LOCAL, json!(null))
            .await
            .unwrap()
    };

    service.approve_request(&approved_id, "admin", None, "").await.unwrap();
    service
        .reject_request(&rejected_id, "admin", "unknown host")
        .await
        .unwrap();

    let approved_before = service.get_request(&approved_id).await.unwrap();
    let rejected_before = service.get_request(&rejected_id).await.unwrap();

    for result in [
        service.approve_request(&approved_id, "other", None, "").await.map(|_| ()),
        service.reject_request(&approved_id, "other", "late").await,
        service.approve_request(&rejected_id, "other", None, "").await.map(|_| ()),
        service.reject_request(&rejected_id, "other", "again").await,
    ] {
        assert!(matches!(result, Err(CaError::InvalidTransition { .. })));
    }

    assert_eq!(service.get_request(&approved_id).await.unwrap(), approved_before);
    assert_eq!(service.get_request(&rejected_id).await.unwrap(), rejected_before);
    assert_eq!(service.list_issued_certificates(None).await.unwrap().len(), 1);

    let view = service.get_certificate_request_status(&rejected_id).await.unwrap();
    assert_eq!(view.status, RequestStatus::Rejected);
    assert_eq!(view.reason.as_deref(), Some("unknown host"));
    assert!(view.certificate_pem.is_none());
}

#[tokio::test]
async fn approve_validates_arguments() {
    let env = TestEnv::new();
    let service = env.open().await;
    let token = issue_token(&service, None).await;
    let request_id = service
        .submit_certificate_request(&csr("host1", "alice"), &token, LOCAL, json!(null))
        .await
        .unwrap();

    for days in [0, 826] {
        assert!(matches!(
            service.approve_request(&request_id, "admin", Some(days), "").await,
            Err(CaError::InvalidArgument { .. })
        ));
    }
    assert!(matches!(
        service.approve_request(&request_id, "", None, "").await,
        Err(CaError::InvalidArgument { .. })
    ));
    assert!(matches!(
        service.reject_request(&request_id, "admin", "  ").await,
        Err(CaError::InvalidArgument { .. })
    ));

    let request = service.get_request(&request_id).await.unwrap();
    assert_eq!(request.status, RequestStatus::PendingApproval);
}

#[tokio::test]
async fn renewal_requires_exact_identity_and_unrevoked_certificate() {
    let env = TestEnv::new();
    let service = env.open().await;

    let token = issue_token(&service, Some("host1_alice_J")).await;
    let request_id = service
        .submit_certificate_request(&csr("host1", "alice"), &token, LOCAL, json!(null))
        .await
        .unwrap();
    let original = service
        .approve_request(&request_id, "admin", Some(30), "")
        .await
        .unwrap();

    let caller = CallerIdentity::from_client_certificate(
        &original.certificate_pem,
        service.ca().certificate_der(),
    )
    .unwrap();
    assert_eq!(caller.common_name(), "host1_alice_J");
    assert_eq!(caller.serial_number(), Some(&original.serial_number));

    let renewed = service
        .renew_certificate(&csr("host1", "alice"), &caller)
        .await
        .unwrap();
    assert_eq!(renewed.issuer, CertificateIssuer::AutoRenewal);
    assert_ne!(renewed.serial_number, original.serial_number);
    assert_eq!(renewed.expires_at - renewed.issued_at, Duration::days(90));
    assert_signed_by(&renewed.certificate_pem, service.get_ca_certificate());

    let err = service
        .renew_certificate(&csr_with_cn("host1_Alice_J"), &caller)
        .await
        .unwrap_err();
    assert!(matches!(err, CaError::IdentityMismatch { .. }));

    service
        .revoke_certificate(&original.serial_number, "admin")
        .await
        .unwrap();
    let err = service
        .renew_certificate(&csr("host1", "alice"), &caller)
        .await
        .unwrap_err();
    assert!(matches!(err, CaError::CertificateRevoked { .. }));
}

#[tokio::test]
async fn foreign_client_certificate_is_untrusted() {
    let env = TestEnv::new();
    let service = env.open().await;

    let key = rcgen::KeyPair::generate().unwrap();
    let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "host1_alice_J");
    let self_signed = params.self_signed(&key).unwrap().pem();

    let err = CallerIdentity::from_client_certificate(&self_signed, service.ca().certificate_der())
        .unwrap_err();
    assert!(matches!(err, CaError::UntrustedClientCertificate { .. }));
}

#[tokio::test]
async fn revocation_is_monotone() {
    let env = TestEnv::new();
    let service = env.open().await;

    let token = issue_token(&service, None).await;
    let request_id = service
        .submit_certificate_request(&csr("host1", "alice"), &token, LOCAL, json!(null))
        .await
        .unwrap();
    let issued = service.approve_request(&request_id, "admin", None, "").await.unwrap();
    let serial = issued.serial_number;

    assert_eq!(
        service.certificate_status(&serial).await.unwrap(),
        CertificateStatus::Active
    );
    let first = service.revoke_certificate(&serial, "admin").await.unwrap();
    let second = service.revoke_certificate(&serial, "auditor").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(
        service.certificate_status(&serial).await.unwrap(),
        CertificateStatus::Revoked
    );

    let revoked = service
        .list_issued_certificates(Some(CertificateStatus::Revoked))
        .await
        .unwrap();
    assert_eq!(revoked.len(), 1);
    assert!(service
        .list_issued_certificates(Some(CertificateStatus::Active))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn state_survives_reopen() {
    let env = TestEnv::new();
    let (serial, request_id, token_id, fingerprint) = {
        let service = env.open().await;
        let token = issue_token(&service, None).await;
        let request_id = service
            .submit_certificate_request(&csr("host1", "alice"), &token, LOCAL, json!(null))
            .await
            .unwrap();
        let issued = service.approve_request(&request_id, "admin", None, "").await.unwrap();
        service.revoke_certificate(&issued.serial_number, "admin").await.unwrap();
        (
            issued.serial_number,
            request_id,
            token,
            service.ca().fingerprint_sha256().to_string(),
        )
    };

    for table in ["tokens.json", "requests.json", "certificates.json", "revocations.json"] {
        assert!(env.store_dir().join(table).exists(), "{table} missing");
    }

    let service = env.open().await;
    assert_eq!(service.ca().fingerprint_sha256(), fingerprint);
    assert_eq!(
        service.get_request(&request_id).await.unwrap().status,
        RequestStatus::Approved
    );
    assert_eq!(
        service.certificate_status(&serial).await.unwrap(),
        CertificateStatus::Revoked
    );

    let err = service
        .submit_certificate_request(&csr("host1", "alice"), &token_id, LOCAL, json!(null))
        .await
        .unwrap_err();
    assert!(matches!(err, CaError::Token(RedeemError::AlreadyUsed)));
}
