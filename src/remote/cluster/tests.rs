//! Unit tests for the cluster convergence operations.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{TimeZone, Utc};
use rstest::{fixture, rstest};

use super::*;
use crate::test_support::{RecordingSleeper, ScriptedRemote};

#[fixture]
fn ssh() -> ScriptedRemote {
    ScriptedRemote::new()
}

#[fixture]
fn oc() -> ScriptedRemote {
    ScriptedRemote::new()
}

#[fixture]
fn sleeper() -> RecordingSleeper {
    RecordingSleeper::new()
}

fn proxy() -> ProxyConfig {
    ProxyConfig {
        http_proxy: String::from("http://proxy:3128"),
        https_proxy: String::from("http://proxy:3129"),
        no_proxy: vec![String::from(".example.com")],
        ..ProxyConfig::default()
    }
}

#[rstest]
fn wait_for_ssh_retries_until_reachable(
    ssh: ScriptedRemote,
    oc: ScriptedRemote,
    sleeper: RecordingSleeper,
) {
    ssh.push_failure("connection refused");
    ssh.push_failure("connection refused");
    ssh.push_ok("");
    let ops = ClusterBootstrap::new(&ssh, &oc).with_sleeper(sleeper.clone());

    ops.wait_for_ssh().expect("third attempt succeeds");

    assert_eq!(ssh.commands(), vec!["exit 0", "exit 0", "exit 0"]);
    assert_eq!(sleeper.durations(), vec![Duration::from_secs(1); 2]);
}

#[rstest]
fn wait_for_ssh_gives_up_after_sixty_attempts(
    ssh: ScriptedRemote,
    oc: ScriptedRemote,
    sleeper: RecordingSleeper,
) {
    let ops = ClusterBootstrap::new(&ssh, &oc).with_sleeper(sleeper.clone());

    let err = ops.wait_for_ssh().expect_err("never reachable");

    assert!(matches!(err, RemoteError::Command(_)));
    assert_eq!(ssh.commands().len(), 60);
    assert_eq!(sleeper.count(), 59);
}

#[rstest]
fn wait_for_resource_retries_not_found(
    ssh: ScriptedRemote,
    oc: ScriptedRemote,
    sleeper: RecordingSleeper,
) {
    oc.push_failure("Error from server (NotFound): the server could not find the requested resource");
    oc.push_failure("error: the server doesn't have a resource type \"clusterversion\"");
    oc.push_ok("NAME VERSION\nversion 4.5.1\n");
    let ops = ClusterBootstrap::new(&ssh, &oc).with_sleeper(sleeper.clone());

    ops.wait_for_resource("clusterversion")
        .expect("resource eventually appears");

    assert_eq!(oc.commands().len(), 3);
    assert_eq!(sleeper.count(), 2);
}

#[rstest]
fn wait_for_resource_stops_on_unexpected_error(
    ssh: ScriptedRemote,
    oc: ScriptedRemote,
    sleeper: RecordingSleeper,
) {
    oc.push_failure("Error from server (Forbidden): access denied");
    let ops = ClusterBootstrap::new(&ssh, &oc).with_sleeper(sleeper.clone());

    let err = ops.wait_for_resource("secret").expect_err("fatal error");

    assert_eq!(err.stderr(), Some("Error from server (Forbidden): access denied"));
    assert_eq!(oc.commands(), vec!["get secret"]);
    assert_eq!(sleeper.count(), 0);
}

#[rstest]
#[case("2000-01-01T00:00:00+00:00", CertExpiry::Expired)]
#[case("2030-06-01T12:00:00+02:00", CertExpiry::NotExpired)]
#[case("not a date", CertExpiry::Unknown)]
#[case("2020-06-01T00:00:00Z", CertExpiry::Expired)]
#[case("2026-01-01T00:00:00+00:00", CertExpiry::Expired)]
#[case("2026-01-01T00:00:01Z", CertExpiry::NotExpired)]
fn classifies_certificate_end_dates(#[case] raw: &str, #[case] expected: CertExpiry) {
    let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().expect("valid date");

    let check = classify_cert_expiry(raw, now);

    assert_eq!(check.state, expected);
    assert_eq!(check.error.is_some(), expected != CertExpiry::NotExpired);
}

#[test]
fn expired_certificate_error_names_the_date() {
    let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().expect("valid date");

    let err = classify_cert_expiry("2000-01-01T00:00:00+00:00\n", now)
        .into_result()
        .expect_err("expired");

    let message = err.to_string();
    assert!(message.contains("valid till"));
    assert!(message.contains("2000"));
}

#[rstest]
fn unreadable_certificate_is_unknown(ssh: ScriptedRemote, oc: ScriptedRemote) {
    ssh.push_failure("openssl: No such file");
    let ops = ClusterBootstrap::new(&ssh, &oc);

    let check = ops.check_certs_validity(Utc::now());

    assert_eq!(check.state, CertExpiry::Unknown);
    assert!(ssh.commands().first().is_some_and(|cmd| cmd.contains("kubelet-client-current.pem")));
}

#[rstest]
fn stop_and_remove_pods_makes_two_attempts(
    ssh: ScriptedRemote,
    oc: ScriptedRemote,
    sleeper: RecordingSleeper,
) {
    ssh.push_failure("crictl: runtime not ready");
    ssh.push_failure("crictl: runtime not ready");
    let ops = ClusterBootstrap::new(&ssh, &oc).with_sleeper(sleeper.clone());

    ops.stop_and_remove_pods().expect_err("both attempts fail");

    assert_eq!(ssh.commands().len(), 2);
    assert_eq!(sleeper.durations(), vec![Duration::from_secs(2)]);
}

#[test]
fn propagate_attempts_every_target() {
    let mut attempted = Vec::new();

    let err = propagate(&["a", "b", "c"], |target| {
        attempted.push(*target);
        if *target == "b" {
            Err(format!("{target} failed"))
        } else {
            Ok(())
        }
    })
    .expect_err("b fails");

    assert_eq!(attempted, vec!["a", "b", "c"]);
    assert_eq!(err.messages(), vec!["b failed"]);
}

#[rstest]
fn proxy_deployments_are_updated_independently(ssh: ScriptedRemote, oc: ScriptedRemote) {
    oc.push_ok("deployments");
    oc.push_ok("");
    oc.push_failure("deployment.apps \"ingress-operator\" not patched");
    oc.push_ok("");
    let ops = ClusterBootstrap::new(&ssh, &oc);

    let err = ops
        .add_proxy_config_to_deployments(&proxy())
        .expect_err("ingress operator fails");

    let ClusterError::Aggregate(errors) = err else {
        panic!("expected aggregate error, got {err:?}");
    };
    assert_eq!(errors.len(), 1);
    assert!(errors.to_string().contains("ingress-operator"));
    let commands = oc.commands();
    assert_eq!(commands.len(), 4);
    assert!(commands.iter().skip(1).all(|cmd| cmd.contains(
        "NO_PROXY=127.0.0.1,localhost,.example.com,.cluster.local,.svc,10.128.0.0/14,172.30.0.0/16"
    )));
}

#[rstest]
fn update_cluster_id_patches_a_fresh_uuid(ssh: ScriptedRemote, oc: ScriptedRemote) {
    oc.push_ok("version");
    oc.push_ok("clusterversion.config.openshift.io/version patched");
    let ops = ClusterBootstrap::new(&ssh, &oc);

    let id = ops.update_cluster_id().expect("patch succeeds");

    let commands = oc.commands();
    let patch = commands.get(1).expect("patch command");
    assert!(patch.starts_with("patch clusterversion version -p"));
    assert!(patch.contains(&format!("\"clusterID\":\"{id}\"")));
}

#[rstest]
fn request_header_ca_waits_for_content(
    ssh: ScriptedRemote,
    oc: ScriptedRemote,
    sleeper: RecordingSleeper,
) {
    oc.push_ok("configmaps");
    oc.push_ok("");
    oc.push_ok("-----BEGIN CERTIFICATE-----");
    let ops = ClusterBootstrap::new(&ssh, &oc).with_sleeper(sleeper.clone());

    ops.wait_for_request_header_client_ca()
        .expect("ca eventually published");

    assert_eq!(sleeper.durations(), vec![Duration::from_secs(2)]);
}

#[rstest]
fn request_header_query_errors_are_fatal(
    ssh: ScriptedRemote,
    oc: ScriptedRemote,
    sleeper: RecordingSleeper,
) {
    oc.push_ok("configmaps");
    oc.push_failure("Error from server (Forbidden)");
    let ops = ClusterBootstrap::new(&ssh, &oc).with_sleeper(sleeper.clone());

    let err = ops
        .wait_for_request_header_client_ca()
        .expect_err("query fails");

    assert!(matches!(err, ClusterError::Update { .. }));
    assert_eq!(sleeper.count(), 0);
}

#[rstest]
fn kubelet_and_crio_drop_ins_use_private_commands(ssh: ScriptedRemote, oc: ScriptedRemote) {
    ssh.push_ok("");
    ssh.push_ok("");
    let ops = ClusterBootstrap::new(&ssh, &oc);

    ops.add_proxy_to_kubelet_and_crio(&proxy())
        .expect("drop-ins written");

    assert_eq!(ssh.private_count(), 2);
    let commands = ssh.commands();
    assert!(commands.first().is_some_and(|cmd| cmd.contains("crio.service.d")));
    assert!(commands.get(1).is_some_and(|cmd| cmd.contains("kubelet.service.d")));
}

#[rstest]
#[case("31036686336 14262472704 /sysroot\n", Some((31_036_686_336, 14_262_472_704)))]
#[case("garbage", None)]
#[case("", None)]
fn parses_root_partition_usage(#[case] raw: &str, #[case] expected: Option<(u64, u64)>) {
    let parsed = parse_disk_usage(raw).ok().map(|usage| (usage.size, usage.used));
    assert_eq!(parsed, expected);
}

#[rstest]
fn pull_secret_is_written_and_patched_privately(
    ssh: ScriptedRemote,
    oc: ScriptedRemote,
    sleeper: RecordingSleeper,
) {
    let secret = r#"{"auths":{"registry.example.com":{"auth":"dXNlcjpwYXNz"}}}"#;
    ssh.push_ok("");
    oc.push_ok("NAME TYPE\npull-secret kubernetes.io/dockerconfigjson\n");
    oc.push_ok("");
    let ops = ClusterBootstrap::new(&ssh, &oc).with_sleeper(sleeper.clone());

    ops.add_pull_secret(secret).expect("pull secret is installed");

    assert_eq!(
        ssh.commands(),
        vec![format!("cat <<EOF | sudo tee /var/lib/kubelet/config.json\n{secret}\nEOF")]
    );
    assert_eq!(ssh.private_count(), 1);
    let encoded = STANDARD.encode(secret);
    assert_eq!(
        oc.commands(),
        vec![
            String::from("get secret"),
            format!(
                r#"patch secret pull-secret -p {{"data":{{".dockerconfigjson":"{encoded}"}}}} -n openshift-config --type merge"#
            ),
        ]
    );
    assert_eq!(oc.private_count(), 1);
    assert_eq!(sleeper.count(), 0);
}

#[rstest]
fn pull_secret_patch_failure_is_reported(ssh: ScriptedRemote, oc: ScriptedRemote) {
    ssh.push_ok("");
    oc.push_ok("pull-secret");
    oc.push_failure("secrets \"pull-secret\" is forbidden");
    let ops = ClusterBootstrap::new(&ssh, &oc);

    let err = ops.add_pull_secret("{}").expect_err("patch fails");

    assert!(matches!(err, ClusterError::Update { ref action, .. } if action == "add pull secret"));
}
