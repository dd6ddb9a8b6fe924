//! Test doubles shared by the integration tests.
//!
//! [`LocalHost`] runs host commands through the local `sh` and emulates the
//! docker CLI: images, networks and containers are tracked in memory and each
//! container gets a directory under the host's sandbox as its file system.
//! Scripts executed inside a container run locally with the container's
//! paths rewritten into that directory, so the `authorized_keys` scripts are
//! exercised for real. Key generation and host key scans are simulated.
//! Windows hosts only record their commands; file transfers still land on
//! the local disk.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cifarm_core::config::{ConfigData, ConfigParser, HostMachineInfo, OsType, CONFIG_FILE_VERSION};
use cifarm_core::connection::{CommandOutput, ConnectionPool, RemoteHost};
use cifarm_core::error::{FarmError, Result};
use cifarm_core::Settings;

static KEY_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// `(machine id, command)` in execution order, shared between hosts.
pub type Journal = Arc<Mutex<Vec<(String, String)>>>;

/// Container paths the farm uses besides volumes.
const CONTAINER_DIRS: [&str; 4] = ["/var/jenkins_home", "/home/jenkins", "/var/www/html", "/root"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeContainer {
    pub image: String,
    pub running: bool,
    /// (host path, container path)
    pub volumes: Vec<(String, String)>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DockerState {
    pub images: BTreeSet<String>,
    pub networks: BTreeSet<String>,
    pub containers: BTreeMap<String, FakeContainer>,
}

struct Inner {
    /// Parent of the container file systems.
    root: PathBuf,
    docker: Mutex<DockerState>,
    commands: Mutex<Vec<String>>,
    journal: Journal,
    closes: AtomicUsize,
    fail_close: AtomicBool,
}

#[derive(Clone)]
pub struct LocalHost {
    info: HostMachineInfo,
    inner: Arc<Inner>,
}

fn output(exit_code: i32, stdout: Vec<String>, stderr: &str) -> CommandOutput {
    let stderr = if stderr.is_empty() { vec![] } else { vec![stderr.to_string()] };
    CommandOutput { exit_code, stdout, stderr }
}

impl LocalHost {
    pub fn new(info: HostMachineInfo, root: PathBuf) -> Self {
        Self::with_journal(info, root, Journal::default())
    }

    /// A host that also appends its commands to `journal`.
    pub fn with_journal(info: HostMachineInfo, root: PathBuf, journal: Journal) -> Self {
        std::fs::create_dir_all(&root).unwrap();
        let inner = Inner {
            root,
            docker: Mutex::new(DockerState::default()),
            commands: Mutex::new(Vec::new()),
            journal,
            closes: AtomicUsize::new(0),
            fail_close: AtomicBool::new(false),
        };
        Self { info, inner: Arc::new(inner) }
    }

    /// Make every later `close` fail after counting it.
    pub fn fail_close(&self) {
        self.inner.fail_close.store(true, Ordering::SeqCst);
    }

    pub fn docker_state(&self) -> DockerState {
        self.inner.docker.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.inner.commands.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    /// Where `path` inside `container` lives on the local disk.
    pub fn container_path(&self, container: &str, path: &str) -> PathBuf {
        let docker = self.inner.docker.lock().unwrap();
        let volumes = docker.containers.get(container).map(|c| c.volumes.clone()).unwrap_or_default();
        map_path(&self.inner.root.join(container), &volumes, path)
    }

    async fn shell(&self, command: &str) -> Result<CommandOutput> {
        let out = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| FarmError::Internal(e.to_string()))?;
        let lines = |bytes: &[u8]| {
            String::from_utf8_lossy(bytes).lines().map(str::to_string).collect::<Vec<_>>()
        };
        Ok(CommandOutput {
            exit_code: out.status.code().unwrap_or(-1),
            stdout: lines(&out.stdout),
            stderr: lines(&out.stderr),
        })
    }

    async fn docker(&self, command: &str) -> Result<CommandOutput> {
        let words = shell_words(command);
        let arg = |i: usize| words.get(i).cloned().unwrap_or_default();
        match arg(1).as_str() {
            "ps" => {
                let all = words.iter().any(|w| w == "-a");
                let docker = self.inner.docker.lock().unwrap();
                let names = docker
                    .containers
                    .iter()
                    .filter(|(_, c)| all || c.running)
                    .map(|(n, _)| n.clone())
                    .collect();
                Ok(output(0, names, ""))
            }
            "image" => {
                let known = self.inner.docker.lock().unwrap().images.contains(&arg(3));
                Ok(output(if known { 0 } else { 1 }, vec![], ""))
            }
            "network" => {
                let mut docker = self.inner.docker.lock().unwrap();
                match arg(2).as_str() {
                    "ls" => Ok(output(0, docker.networks.iter().cloned().collect(), "")),
                    "create" if docker.networks.insert(arg(3)) => Ok(output(0, vec![], "")),
                    "rm" if docker.networks.remove(&arg(3)) => Ok(output(0, vec![], "")),
                    _ => Ok(output(1, vec![], "network conflict")),
                }
            }
            "build" => {
                let image = words.iter().position(|w| w == "-t").map(|i| arg(i + 1)).unwrap_or_default();
                let context = words.last().cloned().unwrap_or_default();
                if !Path::new(&context).join("Dockerfile").is_file() {
                    return Ok(output(1, vec![], "no Dockerfile in build context"));
                }
                self.inner.docker.lock().unwrap().images.insert(image);
                Ok(output(0, vec!["Successfully built".to_string()], ""))
            }
            "run" => self.docker_run(&words),
            "start" | "stop" => {
                let mut docker = self.inner.docker.lock().unwrap();
                match docker.containers.get_mut(&arg(2)) {
                    Some(c) => {
                        c.running = arg(1) == "start";
                        Ok(output(0, vec![arg(2)], ""))
                    }
                    None => Ok(output(1, vec![], "No such container")),
                }
            }
            "rm" => {
                let name = words.last().cloned().unwrap_or_default();
                let removed = self.inner.docker.lock().unwrap().containers.remove(&name);
                if removed.is_none() {
                    return Ok(output(1, vec![], "No such container"));
                }
                let _ = std::fs::remove_dir_all(self.inner.root.join(&name));
                Ok(output(0, vec![name], ""))
            }
            "exec" => {
                let start = if arg(2) == "--user" { 4 } else { 2 };
                let name = arg(start);
                let running = self
                    .inner
                    .docker
                    .lock()
                    .unwrap()
                    .containers
                    .get(&name)
                    .map(|c| c.running)
                    .unwrap_or(false);
                if !running || arg(start + 1) != "sh" || arg(start + 2) != "-c" {
                    return Ok(output(1, vec![], "container not running"));
                }
                self.exec_in(&name, &arg(start + 3)).await
            }
            "cp" => {
                let from = self.cp_path(&arg(2));
                let to = self.cp_path(&arg(3));
                match std::fs::copy(&from, &to) {
                    Ok(_) => Ok(output(0, vec![], "")),
                    Err(e) => Ok(output(1, vec![], &e.to_string())),
                }
            }
            _ => Ok(output(1, vec![], "unknown docker command")),
        }
    }

    fn docker_run(&self, words: &[String]) -> Result<CommandOutput> {
        let mut volumes = Vec::new();
        let mut name = String::new();
        let mut i = 2;
        while i < words.len() {
            match words[i].as_str() {
                "--volume" => {
                    if let Some((host, inner)) = words[i + 1].split_once(':') {
                        volumes.push((host.to_string(), inner.to_string()));
                    }
                    i += 1;
                }
                "--name" => {
                    name = words[i + 1].clone();
                    i += 1;
                }
                "--publish" | "--env" | "--add-host" | "--net" => i += 1,
                _ => {}
            }
            i += 1;
        }
        let image = words.last().cloned().unwrap_or_default();

        let mut docker = self.inner.docker.lock().unwrap();
        if !docker.images.contains(&image) {
            return Ok(output(125, vec![], "Unable to find image"));
        }
        if docker.containers.contains_key(&name) {
            return Ok(output(125, vec![], "Conflict. The container name is already in use"));
        }
        std::fs::create_dir_all(self.inner.root.join(&name)).unwrap();
        docker.containers.insert(name.clone(), FakeContainer { image, running: true, volumes });
        Ok(output(0, vec![format!("{}-id", name)], ""))
    }

    fn cp_path(&self, arg: &str) -> PathBuf {
        if let Some((container, path)) = arg.split_once(':') {
            if self.inner.docker.lock().unwrap().containers.contains_key(container) {
                return self.container_path(container, path);
            }
        }
        PathBuf::from(arg)
    }

    async fn exec_in(&self, container: &str, script: &str) -> Result<CommandOutput> {
        if script.contains("ssh-keygen -q -t rsa") {
            let words = shell_words(script);
            let after = |flag: &str| {
                words.iter().position(|w| w == flag).and_then(|i| words.get(i + 1)).cloned()
            };
            let key = after("-f").unwrap_or_default();
            let marker = after("-C").unwrap_or_default();
            let key = self.container_path(container, &key);
            if !key.exists() {
                std::fs::create_dir_all(key.parent().unwrap()).unwrap();
                let n = KEY_COUNTER.fetch_add(1, Ordering::SeqCst);
                std::fs::write(&key, "PRIVATE KEY").unwrap();
                std::fs::write(key.with_extension("pub"), format!("ssh-rsa AAAAKEY{} {}\n", n, marker))
                    .unwrap();
            }
            return Ok(output(0, vec![], ""));
        }

        if script.contains("ssh-keyscan") {
            let words = shell_words(script);
            let after = |flag: &str| {
                words.iter().position(|w| w == flag).and_then(|i| words.get(i + 1)).cloned()
            };
            let entry = after("-R").unwrap_or_default();
            let known_hosts = self.container_path(container, &after("-f").unwrap_or_default());
            let scan = words.iter().position(|w| w.ends_with("ssh-keyscan")).unwrap_or(0);
            let port = words.get(scan + 2).cloned().unwrap_or_default();
            let host = words.get(scan + 3).cloned().unwrap_or_default();

            let existing = std::fs::read_to_string(&known_hosts).unwrap_or_default();
            let mut lines: Vec<String> = existing
                .lines()
                .filter(|l| !l.starts_with(&format!("{} ", entry)))
                .map(str::to_string)
                .collect();
            lines.push(format!("{} ssh-ed25519 HOSTKEY-{}-{}", entry, host, port));
            std::fs::create_dir_all(known_hosts.parent().unwrap()).unwrap();
            std::fs::write(&known_hosts, lines.join("\n") + "\n").unwrap();
            return Ok(output(0, vec![], ""));
        }

        if script.contains("git config") || script.starts_with("chown ") {
            return Ok(output(0, vec![], ""));
        }

        let rewritten = self.rewrite_container_paths(container, script);
        self.shell(&rewritten).await
    }

    /// Replace container paths at the start of shell words with local ones.
    fn rewrite_container_paths(&self, container: &str, script: &str) -> String {
        let volumes = self
            .inner
            .docker
            .lock()
            .unwrap()
            .containers
            .get(container)
            .map(|c| c.volumes.clone())
            .unwrap_or_default();
        let root = self.inner.root.join(container);
        let mut prefixes: Vec<String> = volumes.iter().map(|(_, inner)| inner.clone()).collect();
        prefixes.extend(CONTAINER_DIRS.iter().map(|d| d.to_string()));
        prefixes.sort_by_key(|p| std::cmp::Reverse(p.len()));

        let mut result = String::new();
        let mut rest = script;
        let mut previous = ' ';
        'scan: while !rest.is_empty() {
            if " '\"=>".contains(previous) {
                for prefix in &prefixes {
                    if let Some(tail) = rest.strip_prefix(prefix.as_str()) {
                        if tail.is_empty() || tail.starts_with(['/', ' ', '\'', '"', ';']) {
                            let local = map_path(&root, &volumes, prefix);
                            result.push_str(&local.to_string_lossy());
                            previous = prefix.chars().last().unwrap_or(' ');
                            rest = tail;
                            continue 'scan;
                        }
                    }
                }
            }
            let c = rest.chars().next().unwrap();
            result.push(c);
            previous = c;
            rest = &rest[c.len_utf8()..];
        }
        result
    }
}

fn map_path(container_root: &Path, volumes: &[(String, String)], path: &str) -> PathBuf {
    for (host, inner) in volumes {
        if path == inner {
            return PathBuf::from(host);
        }
        if let Some(tail) = path.strip_prefix(&format!("{}/", inner)) {
            return PathBuf::from(host).join(tail);
        }
    }
    container_root.join(path.trim_start_matches('/'))
}

#[async_trait]
impl RemoteHost for LocalHost {
    fn info(&self) -> &HostMachineInfo {
        &self.info
    }

    async fn execute(&self, command: &str, _stream_output: bool) -> Result<CommandOutput> {
        self.inner.commands.lock().unwrap().push(command.to_string());
        let entry = (self.info.machine_id.clone(), command.to_string());
        self.inner.journal.lock().unwrap().push(entry);
        if self.info.is_windows() {
            return Ok(output(0, vec![], ""));
        }
        if command.starts_with("docker ") {
            self.docker(command).await
        } else {
            self.shell(command).await
        }
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        std::fs::copy(local, remote).map(|_| ()).map_err(|e| FarmError::TransferFailed {
            machine_id: self.info.machine_id.clone(),
            source_path: local.display().to_string(),
            target_path: remote.to_string(),
            reason: e.to_string(),
        })
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<()> {
        std::fs::copy(remote, local).map(|_| ()).map_err(|e| FarmError::TransferFailed {
            machine_id: self.info.machine_id.clone(),
            source_path: remote.to_string(),
            target_path: local.display().to_string(),
            reason: e.to_string(),
        })
    }

    async fn close(&self) -> Result<()> {
        self.inner.closes.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_close.load(Ordering::SeqCst) {
            return Err(FarmError::Internal("session already gone".to_string()));
        }
        Ok(())
    }
}

/// Split a POSIX shell line into words, undoing quoting.
pub fn shell_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        if in_single {
            if c == '\'' {
                in_single = false;
            } else {
                current.push(c);
            }
            continue;
        }
        if in_double {
            match c {
                '"' => in_double = false,
                '\\' => current.extend(chars.next()),
                _ => current.push(c),
            }
            continue;
        }
        match c {
            '\'' => {
                in_single = true;
                in_word = true;
            }
            '"' => {
                in_double = true;
                in_word = true;
            }
            '\\' => {
                current.extend(chars.next());
                in_word = true;
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

// ============================================================================
// Farm fixture
// ============================================================================

/// Two Linux hosts: `Main` runs the master, an agent and hosts the
/// repositories; `Second` runs an agent and the web-server of one CPF job.
/// Optionally a third host `Win` runs a native Windows agent.
pub struct Farm {
    pub dir: tempfile::TempDir,
    pub config: ConfigData,
    pub settings: Settings,
    pub main: LocalHost,
    pub second: LocalHost,
    pub windows: Option<LocalHost>,
    pub journal: Journal,
}

impl Farm {
    pub fn new(unconfigured: bool) -> Self {
        Self::build(unconfigured, false)
    }

    pub fn with_windows_agent(unconfigured: bool) -> Self {
        Self::build(unconfigured, true)
    }

    fn build(unconfigured: bool, windows: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_path_buf();
        for sub in ["main/tmp", "main/ssh", "second/tmp", "second/html", "win/tmp"] {
            std::fs::create_dir_all(base.join(sub)).unwrap();
        }

        let assets = base.join("assets");
        for image in ["jenkins-master-image", "jenkins-slave-linux-image", "cpf-web-server-image"] {
            let context = assets.join("docker").join(image);
            std::fs::create_dir_all(&context).unwrap();
            std::fs::write(context.join("Dockerfile"), "FROM debian\r\nRUN true\r\n").unwrap();
        }
        std::fs::create_dir_all(assets.join("jenkins/general")).unwrap();
        std::fs::write(assets.join("jenkins/general/config.xml"), "<hudson/>").unwrap();
        std::fs::write(
            assets.join("jenkins/cpf-job-config.xml.in"),
            "$JOB_NAME|$BUILD_REPOSITORY|$WEBSERVER_HOST:$WEBSERVER_WEB_PORT",
        )
        .unwrap();
        std::fs::write(base.join("hans.xml"), "<user>hans</user>").unwrap();

        let document = farm_document(&base, unconfigured, windows);
        std::fs::write(base.join("farm.json"), &document).unwrap();
        let config = ConfigParser::parse_file(base.join("farm.json")).unwrap();

        let settings = Settings {
            assets_dir: assets,
            jenkins_online_initial_delay_secs: 0,
            jenkins_online_max_wait_secs: 0,
            ..Settings::default()
        };

        let journal = Journal::default();
        let host = |id: &str, sub: &str| {
            let info = config.host_info(id).unwrap().clone();
            LocalHost::with_journal(info, base.join(sub), journal.clone())
        };
        let main = host("Main", "main/containers");
        let second = host("Second", "second/containers");
        let windows = windows.then(|| host("Win", "win/root"));
        Self { dir, config, settings, main, second, windows, journal }
    }

    pub fn base(&self) -> &Path {
        self.dir.path()
    }

    pub fn pool(&self) -> ConnectionPool {
        let mut hosts: Vec<Box<dyn RemoteHost>> =
            vec![Box::new(self.main.clone()), Box::new(self.second.clone())];
        if let Some(windows) = &self.windows {
            hosts.push(Box::new(windows.clone()));
        }
        ConnectionPool::from_hosts(hosts)
    }

    /// Every journaled command that rewrites an `authorized_keys` file, as
    /// `(key owner, where)`. `where` is a container name or `host:<id>`.
    pub fn authorized_key_writes(&self) -> Vec<(String, String)> {
        self.journal
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(machine_id, command)| authorized_key_write(machine_id, command))
            .collect()
    }

    pub fn repository_keys(&self) -> String {
        std::fs::read_to_string(self.base().join("main/ssh/authorized_keys")).unwrap_or_default()
    }
}

fn authorized_key_write(machine_id: &str, command: &str) -> Option<(String, String)> {
    let words = shell_words(command);
    let (place, script) = if words.first()? == "docker" && words.get(1)? == "exec" {
        let start = if words.get(2)? == "--user" { 4 } else { 2 };
        (words.get(start)?.clone(), words.get(start + 3)?.clone())
    } else {
        (format!("host:{}", machine_id), command.to_string())
    };
    if !script.contains("authorized_keys") || !script.contains("awk") {
        return None;
    }
    let owner = shell_words(&script)
        .into_iter()
        .find_map(|w| w.strip_prefix("m=").map(str::to_string))?;
    Some((owner, place))
}

pub fn farm_document(base: &Path, unconfigured: bool, windows: bool) -> String {
    let p = |sub: &str| base.join(sub).to_string_lossy().to_string();
    let mut hosts = vec![
        serde_json::json!({ "MachineID": "Main", "HostNameOrIP": "localhost", "User": "u1",
                            "OSType": "Linux", "TemporaryDirectory": p("main/tmp") }),
        serde_json::json!({ "MachineID": "Second", "HostNameOrIP": "localhost", "User": "u2",
                            "OSType": "Linux", "TemporaryDirectory": p("second/tmp") }),
    ];
    let mut slaves = vec![
        serde_json::json!({ "MachineID": "Second", "Executors": 2 }),
        serde_json::json!({ "MachineID": "Main", "Executors": "1" }),
    ];
    if windows {
        hosts.push(serde_json::json!({ "MachineID": "Win", "HostNameOrIP": "127.0.0.1",
                                       "User": "builder", "OSType": "Windows",
                                       "TemporaryDirectory": p("win/tmp") }));
        slaves.push(serde_json::json!({ "MachineID": "Win", "Executors": 1 }));
    }
    serde_json::json!({
        "CIFarmVersion": CONFIG_FILE_VERSION,
        "HostMachines": hosts,
        "JenkinsMasterHost": { "MachineID": "Main", "HostJenkinsMasterShare": p("main/jenkins_home") },
        "SSHRepositoryHosts": [ { "MachineID": "Main", "SSHDir": p("main/ssh") } ],
        "JenkinsSlaves": slaves,
        "JenkinsConfig": {
            "UseUnconfiguredJenkins": unconfigured,
            "JenkinsAdminUser": "admin",
            "JenkinsAdminUserPassword": "secret",
            "JenkinsAccountConfigFiles": { "hans": "hans.xml" },
            "JenkinsJobConfigFiles": {},
            "CPFJobs": [
                { "JenkinsJobBasename": "BuildProject",
                  "Repository": "ssh://u1@localhost/repos/Project.git",
                  "WebServerConfig": { "MachineID": "Second", "HostHTMLShare": p("second/html") } }
            ]
        }
    })
    .to_string()
}

/// Markers (last field) of an `authorized_keys` or `known_hosts` content.
pub fn markers(content: &str) -> Vec<String> {
    let mut markers: Vec<String> = content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| l.split_whitespace().last().map(str::to_string))
        .collect();
    markers.sort();
    markers
}

pub fn linux_host(machine_id: &str, temp_dir: &Path) -> HostMachineInfo {
    HostMachineInfo {
        machine_id: machine_id.to_string(),
        host_name: "localhost".to_string(),
        user_name: machine_id.to_lowercase(),
        user_password: String::new(),
        os_type: OsType::Linux,
        temp_dir: temp_dir.to_string_lossy().to_string(),
    }
}
