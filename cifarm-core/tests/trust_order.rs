//! Order of the trust edges and the Windows agent edge.

mod common;

use cifarm_core::trust::windows_authorized_key_script;
use cifarm_core::Orchestrator;
use common::Farm;

fn write(owner: &str, place: &str) -> (String, String) {
    (owner.to_string(), place.to_string())
}

/// Index of the first journal entry `(machine id, command)` matching `pred`.
fn index_of(journal: &[(String, String)], pred: impl Fn(&str, &str) -> bool) -> usize {
    journal.iter().position(|(m, c)| pred(m, c)).unwrap()
}

/// Whether `command` rewrites `authorized_keys` of `container` for `owner`.
fn grants_in(command: &str, owner: &str, container: &str) -> bool {
    command.contains("awk")
        && command.contains(&format!("m={}", owner))
        && command.contains(&format!("{} sh -c", container))
}

#[tokio::test]
async fn test_agent_grants_run_repositories_first() {
    let farm = Farm::new(true);
    let pool = farm.pool();
    let orchestrator = Orchestrator::new(&farm.config, &pool, &farm.settings);
    orchestrator.teardown().await.unwrap();
    orchestrator.build_and_start().await.unwrap();
    farm.journal.lock().unwrap().clear();

    orchestrator.provision_trust().await.unwrap();

    assert_eq!(
        farm.authorized_key_writes(),
        vec![
            write("jenkins-master", "host:Main"),
            write("jenkins-master", "jenkins-slave-linux-0"),
            write("jenkins-master", "jenkins-slave-linux-1"),
            write("jenkins-master", "cpf-web-server-0"),
            write("jenkins-slave-linux-0", "host:Main"),
            write("jenkins-slave-linux-1", "host:Main"),
            write("jenkins-slave-linux-0", "cpf-web-server-0"),
            write("jenkins-slave-linux-1", "cpf-web-server-0"),
        ]
    );

    // Both agent key pairs exist before the first agent grant.
    let journal = farm.journal.lock().unwrap().clone();
    let last_agent_key = journal
        .iter()
        .rposition(|(_, c)| c.contains("ssh-keygen -q") && c.contains("jenkins-slave-linux-"))
        .unwrap();
    let first_agent_grant =
        index_of(&journal, |_, c| c.contains("awk") && c.contains("m=jenkins-slave-linux-"));
    assert!(last_agent_key < first_agent_grant);
}

#[tokio::test]
async fn test_master_key_reaches_windows_agent() {
    let farm = Farm::with_windows_agent(true);
    let pool = farm.pool();
    Orchestrator::new(&farm.config, &pool, &farm.settings).run().await.unwrap();
    let windows = farm.windows.as_ref().unwrap();

    // The key is staged in the Windows temp dir and registered by cmd.exe.
    let staged = farm.base().join("win/tmp/jenkins-master_id_rsa.pub");
    let master_key =
        std::fs::read_to_string(farm.base().join("main/jenkins_home/.ssh/id_rsa.pub")).unwrap();
    assert_eq!(std::fs::read_to_string(&staged).unwrap(), master_key);
    let script = windows_authorized_key_script(&staged.to_string_lossy(), "jenkins-master");
    assert_eq!(windows.commands(), vec![script.clone()]);

    // The Windows edge runs after the Linux agents and before the web-server.
    let journal = farm.journal.lock().unwrap().clone();
    let windows_grant = index_of(&journal, |m, c| m == "Win" && c == script);
    let last_agent =
        index_of(&journal, |_, c| grants_in(c, "jenkins-master", "jenkins-slave-linux-1"));
    let webserver = index_of(&journal, |_, c| grants_in(c, "jenkins-master", "cpf-web-server-0"));
    assert!(last_agent < windows_grant && windows_grant < webserver);

    // The master knows the Windows host key on port 22.
    let known_hosts =
        farm.main.container_path("jenkins-master", "/var/jenkins_home/.ssh/known_hosts");
    let known_hosts = std::fs::read_to_string(known_hosts).unwrap();
    assert!(
        known_hosts.lines().any(|l| l == "127.0.0.1 ssh-ed25519 HOSTKEY-127.0.0.1-22"),
        "{}",
        known_hosts
    );
}
