// Tests are allowed to panic for assertions and test failure
#![allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]

//! End-to-end task flows against the in-memory daemon.

mod common;

use std::sync::Arc;

use common::{FakeDocker, FakeExec};
use icm_docker::commands::{CleanDb, PrepareMode};
use icm_docker::config::Config;
use icm_docker::descriptor::ContainerRole;
use icm_docker::lifecycle::ContainerState;
use icm_docker::tasks::Tasks;
use icm_docker::OrchestratorError;
use tokio::net::TcpListener;

const BASE: &str = r#"
[server]
cartridges = ["app_sf_rest", "app_sf_base"]

[database]
kind = "mssql"
host = "icm-mssql"
port = 1433
name = "icmdb"
user = "icm"
password = "secret"

[containers.appserver]
image = "intershophub/icm-as:11.0.0"

[timings.db_init]
interval_ms = 10
timeout_ms = 5000

[timings.db_prepare]
interval_ms = 10
timeout_ms = 5000

[timings.unit_test]
interval_ms = 10
timeout_ms = 5000

[timings.socket_probe]
interval_ms = 10
timeout_ms = 2000
"#;

const SUMMARY: &str = "DBInit with 14 initialization steps finished (success: 14 failure: 0)";

fn tasks(docker: &FakeDocker, extra: &str) -> Tasks {
    let config = Config::from_toml(&format!("{BASE}\n{extra}")).unwrap();
    Tasks::new(config, Arc::new(docker.clone()))
}

fn with_appserver(running: bool) -> FakeDocker {
    FakeDocker::new().with_container("as1", "icm-appserver", "intershophub/icm-as:11.0.0", running)
}

fn script_exec(docker: &FakeDocker, stdout: &[&str], exit_code: i64) {
    docker.state().exec = FakeExec {
        stdout: stdout.iter().map(|s| (*s).to_owned()).collect(),
        stderr: Vec::new(),
        exit_code,
        running_polls: Some(1),
    };
}

fn error_of(err: anyhow::Error) -> OrchestratorError {
    err.downcast::<OrchestratorError>()
        .expect("should be OrchestratorError")
}

#[tokio::test]
async fn start_mail_waits_for_its_port() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let extra = format!(
        r#"
[containers.mail]
ports = [{{ name = "smtp", host = {port}, container = 1025, primary = true }}]
"#
    );
    let docker = FakeDocker::new();
    let handle = tasks(&docker, &extra).start(ContainerRole::Mail).await.unwrap();

    assert_eq!(handle.name(), "icm-mail");
    assert!(handle.is_running());
    assert_eq!(docker.state().pulls, vec!["mailhog/mailhog:latest".to_owned()]);
}

#[tokio::test]
async fn start_twice_reuses_running_container() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let extra = format!(
        r#"
[containers.solr]
ports = [{{ name = "solr", host = {port}, container = 8983, primary = true }}]
"#
    );
    let docker = FakeDocker::new();
    let tasks = tasks(&docker, &extra);
    let first = tasks.start(ContainerRole::Solr).await.unwrap();
    let second = tasks.start(ContainerRole::Solr).await.unwrap();
    assert_eq!(first.id(), second.id());
    let state = docker.state();
    assert_eq!(state.created.len(), 1);
    assert_eq!(state.start_calls, 1);
}

#[tokio::test]
async fn stop_and_remove_absent_container_do_nothing() {
    let docker = FakeDocker::new();
    let tasks = tasks(&docker, "");
    tasks.stop(ContainerRole::Zookeeper).await.unwrap();
    tasks.remove(ContainerRole::Zookeeper).await.unwrap();
    let state = docker.state();
    assert_eq!(state.stop_calls, 0);
    assert_eq!(state.remove_calls, 0);
}

#[tokio::test]
async fn status_follows_stop_and_remove() {
    let docker = with_appserver(true);
    let tasks = tasks(&docker, "");
    assert_eq!(tasks.status(ContainerRole::AppServer).await.unwrap(), ContainerState::FoundRunning);
    tasks.stop(ContainerRole::AppServer).await.unwrap();
    assert_eq!(tasks.status(ContainerRole::AppServer).await.unwrap(), ContainerState::FoundStopped);
    tasks.remove(ContainerRole::AppServer).await.unwrap();
    assert_eq!(tasks.status(ContainerRole::AppServer).await.unwrap(), ContainerState::Unknown);
}

#[tokio::test]
async fn remove_all_uses_project_prefix() {
    let docker = with_appserver(false).with_container("m1", "icm-mail", "mailhog/mailhog:latest", true);
    let removed = tasks(&docker, "").remove_all().await.unwrap();
    assert_eq!(removed, 2);
    assert!(docker.state().containers.is_empty());
}

#[tokio::test]
async fn db_init_without_appserver_is_not_found() {
    let docker = FakeDocker::new();
    let err = tasks(&docker, "").db_init().await.unwrap_err();
    assert!(matches!(error_of(err), OrchestratorError::NotFound { .. }));
    assert!(docker.state().exec_commands.is_empty());
}

#[tokio::test]
async fn db_init_with_stopped_appserver_is_not_found() {
    let docker = with_appserver(false);
    let err = tasks(&docker, "").db_init().await.unwrap_err();
    assert_eq!(error_of(err).code(), "E006");
}

#[tokio::test]
async fn db_init_reports_summary() {
    let docker = with_appserver(true);
    script_exec(&docker, &["Loading cartridges", SUMMARY], 0);
    let result = tasks(&docker, "").db_init().await.unwrap();

    assert_eq!(result.success_count, 14);
    assert_eq!(result.message, SUMMARY);
    assert_eq!(
        docker.state().exec_commands.first().unwrap().join(" "),
        "/intershop/bin/intershop.sh dbinit -classic --clean-db=yes"
    );
}

#[tokio::test]
async fn db_prepare_passes_filters() {
    let docker = with_appserver(true);
    script_exec(&docker, &[SUMMARY], 0);
    tasks(&docker, "")
        .db_prepare(
            PrepareMode::Migrate,
            CleanDb::No,
            &["app_sf_rest".to_owned(), "app_sf_base".to_owned()],
            &[],
        )
        .await
        .unwrap();
    let command = docker.state().exec_commands.first().unwrap().join(" ");
    assert!(command.contains("dbprepare"), "{command}");
    assert!(command.contains("--mode=migrate"), "{command}");
    assert!(command.contains("--cartridges=app_sf_rest,app_sf_base"), "{command}");
    assert!(!command.contains("--property-keys"), "{command}");
}

#[tokio::test]
async fn db_init_without_database_section_is_config_error() {
    let docker = with_appserver(true);
    let config = Config::from_toml("").unwrap();
    let err = Tasks::new(config, Arc::new(docker.clone()))
        .db_init()
        .await
        .unwrap_err();
    assert_eq!(error_of(err).code(), "E001");
}

#[tokio::test]
async fn unit_test_failure_exit_is_reported() {
    let docker = with_appserver(true);
    script_exec(&docker, &["Tests run: 3, Failures: 1"], 1);
    let err = tasks(&docker, "")
        .unit_test("app_sf_rest", "tests.SuiteAll")
        .await
        .unwrap_err();
    let err = error_of(err);
    assert!(matches!(err, OrchestratorError::ExecutionFailure { exit_code: Some(1), .. }));
    let command = docker.state().exec_commands.first().unwrap().clone();
    assert_eq!(
        command,
        vec![
            "/intershop/bin/ishunitrunner.sh",
            "/intershop/build",
            "app_sf_rest",
            "-s=tests.SuiteAll"
        ]
    );
}

#[tokio::test]
async fn unit_test_needs_suite() {
    let docker = with_appserver(true);
    let err = tasks(&docker, "").unit_test("app_sf_rest", " ").await.unwrap_err();
    assert_eq!(error_of(err).code(), "E001");
    assert!(docker.state().exec_commands.is_empty());
}
