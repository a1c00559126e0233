mod common;

use common::{csr, TestEnv, LOCAL};
use mwca_core::csr_types::RequestStatus;
use std::path::Path;
use std::process::{Command, Output};

fn mwca(config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_mwca"))
        .arg("--config")
        .arg(config)
        .args(args)
        .env("NO_COLOR", "1")
        .env_remove("MWCA_PRINCIPAL")
        .output()
        .expect("failed to execute mwca binary")
}

fn write_config(root: &Path) -> std::path::PathBuf {
    let path = root.join("mwca.toml");
    std::fs::write(
        &path,
        "data_dir = \".\"\n\n[telemetry]\nlog_level = \"warn\"\nlog_no_ansi = true\n",
    )
    .unwrap();
    path
}

#[test]
fn admin_commands_require_initialized_ca() {
    let root = tempfile::tempdir().unwrap();
    let config = write_config(root.path());

    let output = mwca(&config, &["token", "list"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("mwca init"), "stderr: {stderr}");
    assert!(!root.path().join("ca").join("ca.key").exists());
}

#[test]
fn unknown_config_key_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let config = root.path().join("mwca.toml");
    std::fs::write(&config, "data_dir = \".\"\nlisten = \"0.0.0.0:5000\"\n").unwrap();

    let output = mwca(&config, &["ca", "show"]);
    assert_ne!(output.status.code(), Some(0));
}

#[tokio::test]
async fn cli_operates_on_durable_stores() {
    let env = TestEnv::new();
    let config = write_config(env.root.path());

    let (request_id, ca_pem) = {
        let service = env.open().await;
        let token = service
            .issue_bootstrap_token(Some("host1_alice_J".into()), None, None, "", "ops")
            .await
            .unwrap();
        let request_id = service
            .submit_certificate_request(
                &csr("host1", "alice"),
                token.token_id.as_str(),
                LOCAL,
                serde_json::Value::Null,
            )
            .await
            .unwrap();
        (request_id, service.get_ca_certificate().to_string())
    };

    let shown = mwca(&config, &["ca", "show"]);
    assert!(shown.status.success());
    assert_eq!(String::from_utf8_lossy(&shown.stdout).trim(), ca_pem.trim());

    let pending = mwca(&config, &["request", "list", "--pending"]);
    assert!(pending.status.success());
    assert!(String::from_utf8_lossy(&pending.stdout).contains("host1_alice_J"));

    let approved = mwca(
        &config,
        &["request", "approve", request_id.as_str(), "--days", "30", "--by", "admin"],
    );
    assert!(
        approved.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&approved.stderr)
    );

    let again = mwca(
        &config,
        &["request", "approve", request_id.as_str(), "--by", "admin"],
    );
    assert_eq!(again.status.code(), Some(1));

    let out_dir = env.root.path().join("issued");
    let status = mwca(
        &config,
        &[
            "request",
            "status",
            request_id.as_str(),
            "--out-dir",
            out_dir.to_str().unwrap(),
        ],
    );
    assert!(status.status.success());
    assert_eq!(
        std::fs::read_to_string(out_dir.join("ca.crt")).unwrap(),
        ca_pem
    );
    common::assert_signed_by(
        &std::fs::read_to_string(out_dir.join("client.crt")).unwrap(),
        &ca_pem,
    );

    let service = env.open().await;
    let request = service.get_request(&request_id).await.unwrap();
    assert_eq!(request.status, RequestStatus::Approved);
    assert_eq!(request.approved_by.as_deref(), Some("admin"));
}

#[tokio::test]
async fn exported_token_file_is_private() {
    let env = TestEnv::new();
    let config = write_config(env.root.path());
    let token = {
        let service = env.open().await;
        service
            .issue_bootstrap_token(Some("host1_alice_J".into()), None, None, "", "ops")
            .await
            .unwrap()
            .token_id
    };

    let out = env.root.path().join("agent.token");
    let exported = mwca(
        &config,
        &[
            "token",
            "export",
            token.as_str(),
            "--format",
            "json",
            "--out",
            out.to_str().unwrap(),
        ],
    );
    assert!(
        exported.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&exported.stderr)
    );

    let body: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(body["token"], token.as_str());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&out).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
