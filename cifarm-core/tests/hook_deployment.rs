//! Post-receive hooks installed through a pool.

mod common;

use std::os::unix::fs::PermissionsExt;

use cifarm_core::connection::ConnectionPool;
use cifarm_core::hooks::{self, HookConfigData};
use cifarm_core::FarmError;
use common::{linux_host, LocalHost};

fn document(hook_dir: &str, second_dir: &str) -> String {
    serde_json::json!({
        "JenkinsAccount": {
            "JenkinsUrl": "http://jenkins:8080/",
            "JenkinsUser": "fritz",
            "JenkinsPassword": "pw"
        },
        "RepositoryMachines": [
            { "MachineID": "Repo", "HostNameOrIP": "localhost", "User": "repo", "OSType": "Linux" }
        ],
        "CPFBuildJobs": [{
            "JenkinsJobBasename": "BuildProject",
            "HookedRepositories": [
                { "MachineID": "Repo", "HookDirectory": hook_dir },
                { "MachineID": "Repo", "HookDirectory": second_dir, "BuildJobPackageArg": "Lib" }
            ]
        }]
    })
    .to_string()
}

#[tokio::test]
async fn test_hooks_are_written_and_executable() {
    let dir = tempfile::tempdir().unwrap();
    let project = dir.path().join("Project.git/hooks");
    let library = dir.path().join("Lib.git/hooks");
    std::fs::create_dir_all(&project).unwrap();
    std::fs::create_dir_all(&library).unwrap();

    let data =
        HookConfigData::parse(&document(&project.to_string_lossy(), &library.to_string_lossy()))
            .unwrap();
    let host = LocalHost::new(linux_host("Repo", dir.path()), dir.path().join("containers"));
    let pool = ConnectionPool::from_hosts(vec![Box::new(host.clone())]);

    let template = "@JENKINS_URL@ @JENKINS_USER@:@JENKINS_PASSWORD@ @JENKINS_JOB_NAME@ [@CPF_PACKAGE@]";
    let mut deployed = Vec::new();
    hooks::deploy_hooks(&data, &pool, template, |hook| deployed.push(hook.package_arg.clone()))
        .await
        .unwrap();
    assert_eq!(deployed, vec!["", "Lib"]);
    pool.close().await.unwrap();

    let hook = project.join("post-receive");
    assert_eq!(
        std::fs::read_to_string(&hook).unwrap(),
        "http://jenkins:8080 fritz:pw BuildProject []"
    );
    assert_eq!(
        std::fs::read_to_string(library.join("post-receive")).unwrap(),
        "http://jenkins:8080 fritz:pw BuildProject [Lib]"
    );
    let mode = std::fs::metadata(&hook).unwrap().permissions().mode();
    assert_ne!(mode & 0o111, 0);
    assert_eq!(host.close_count(), 1);
}

#[tokio::test]
async fn test_missing_hook_directory_fails() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope/hooks");
    let data = HookConfigData::parse(&document(
        &missing.to_string_lossy(),
        &missing.to_string_lossy(),
    ))
    .unwrap();
    let host = LocalHost::new(linux_host("Repo", dir.path()), dir.path().join("containers"));
    let pool = ConnectionPool::from_hosts(vec![Box::new(host)]);

    let mut deployed = 0;
    let err = hooks::deploy_hooks(&data, &pool, "x", |_| deployed += 1).await.unwrap_err();
    assert!(matches!(err, FarmError::TransferFailed { .. }), "{}", err);
    assert_eq!(deployed, 0);
}
