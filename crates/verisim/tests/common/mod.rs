//! In-memory container engine for integration tests.
//!
//! Emulates just enough of a container with the Icarus toolchain installed:
//! a per-container file map, the handful of commands the crate issues, and
//! scripted compiler/runtime outcomes. Failures can be injected per step.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use verisim::engine::{
    ContainerEngine, ContainerInfo, ContainerState, CreateSpec, EngineError, ExecOutput,
    ExecRequest,
};

/// Scripted outcome of a toolchain command.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl Script {
    pub fn ok(stdout: &str) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn fail(exit_code: i32, stderr: &str) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

#[derive(Debug)]
struct Container {
    name: String,
    state: ContainerState,
    pending_polls: u32,
    bind: Option<(String, String)>,
    dirs: BTreeSet<String>,
    files: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct State {
    containers: HashMap<String, Container>,
    next_id: u32,
    execs: Vec<Vec<String>>,
    archives: u32,
    compile: Script,
    simulate: Script,
    dump: Option<String>,
    start_lag: u32,
    never_runs: bool,
    exec_delay: Option<Duration>,
    fail_create: bool,
    fail_archive: bool,
    fail_base64: bool,
    fail_inline: bool,
    fail_stop: bool,
    fail_remove: bool,
    fail_close: bool,
    closed: bool,
}

/// A [`ContainerEngine`] that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MockEngine {
    state: Mutex<State>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    // ===== Setup =====

    pub fn script_compile(&self, script: Script) {
        self.with(|s| s.compile = script);
    }

    pub fn script_simulate(&self, script: Script, dump: Option<&str>) {
        self.with(|s| {
            s.simulate = script;
            s.dump = dump.map(str::to_string);
        });
    }

    pub fn set_start_lag(&self, polls: u32) {
        self.with(|s| s.start_lag = polls);
    }

    pub fn set_never_runs(&self) {
        self.with(|s| s.never_runs = true);
    }

    pub fn set_exec_delay(&self, delay: Duration) {
        self.with(|s| s.exec_delay = Some(delay));
    }

    pub fn fail_create(&self) {
        self.with(|s| s.fail_create = true);
    }

    pub fn fail_archive(&self) {
        self.with(|s| s.fail_archive = true);
    }

    pub fn fail_base64(&self) {
        self.with(|s| s.fail_base64 = true);
    }

    pub fn fail_inline(&self) {
        self.with(|s| s.fail_inline = true);
    }

    pub fn fail_stop(&self) {
        self.with(|s| s.fail_stop = true);
    }

    pub fn fail_remove(&self) {
        self.with(|s| s.fail_remove = true);
    }

    pub fn fail_close(&self) {
        self.with(|s| s.fail_close = true);
    }

    /// Register an existing container, as if left over from an earlier run.
    pub fn insert_container(&self, name: &str, state: ContainerState) -> String {
        self.with(|s| {
            s.next_id += 1;
            let id = format!("mock{:04}", s.next_id);
            s.containers.insert(
                id.clone(),
                Container {
                    name: name.to_string(),
                    state,
                    pending_polls: 0,
                    bind: None,
                    dirs: BTreeSet::new(),
                    files: BTreeMap::new(),
                },
            );
            id
        })
    }

    // ===== Inspection =====

    pub fn container_state(&self, name: &str) -> Option<ContainerState> {
        self.with(|s| {
            s.containers
                .values()
                .find(|c| c.name == name)
                .map(|c| c.state)
        })
    }

    pub fn container_count(&self) -> usize {
        self.with(|s| s.containers.len())
    }

    pub fn bind_of(&self, name: &str) -> Option<(String, String)> {
        self.with(|s| {
            s.containers
                .values()
                .find(|c| c.name == name)
                .and_then(|c| c.bind.clone())
        })
    }

    pub fn file(&self, name: &str, path: &str) -> Option<String> {
        self.with(|s| {
            s.containers
                .values()
                .find(|c| c.name == name)
                .and_then(|c| c.files.get(path).cloned())
        })
    }

    pub fn execs(&self) -> Vec<Vec<String>> {
        self.with(|s| s.execs.clone())
    }

    pub fn archive_count(&self) -> u32 {
        self.with(|s| s.archives)
    }

    pub fn is_closed(&self) -> bool {
        self.with(|s| s.closed)
    }

    fn container<'s>(s: &'s mut State, id: &str) -> Result<&'s mut Container, EngineError> {
        s.containers
            .get_mut(id)
            .filter(|c| c.state != ContainerState::Removed)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }
}

fn failed(command: &str, stderr: &str) -> EngineError {
    EngineError::CommandFailed {
        command: command.to_string(),
        status: 1,
        stderr: stderr.to_string(),
    }
}

fn exit(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> ExecOutput {
    ExecOutput {
        exit_code,
        stdout: stdout.into(),
        stderr: stderr.into(),
    }
}

fn absolute(workdir: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", workdir.trim_end_matches('/'), path)
    }
}

fn run(s: &mut State, id: &str, request: &ExecRequest) -> Result<ExecOutput, EngineError> {
    let compile = s.compile.clone();
    let simulate = s.simulate.clone();
    let dump = s.dump.clone();
    let fail_base64 = s.fail_base64;
    let fail_inline = s.fail_inline;

    let container = MockEngine::container(s, id)?;
    if container.state != ContainerState::Running {
        return Err(failed("exec", "container is not running"));
    }

    let wd = request.workdir.as_str();
    let stdin = request.stdin.clone().unwrap_or_default();
    let mut argv: Vec<&str> = request.argv.iter().map(String::as_str).collect();
    if let ["timeout", "-s", "KILL", _, _, ..] = argv.as_slice() {
        argv.drain(..4);
    }

    let output = match argv.as_slice() {
        ["mkdir", "-p", dir] => {
            container.dirs.insert(absolute(wd, dir));
            exit(0, "", "")
        }
        ["test", "-f", path] => {
            let code = i32::from(!container.files.contains_key(&absolute(wd, path)));
            exit(code, "", "")
        }
        ["cat", path] => match container.files.get(&absolute(wd, path)) {
            Some(content) => exit(0, content.clone(), ""),
            None => exit(1, "", format!("cat: {path}: No such file or directory")),
        },
        ["rm", "-f", paths @ ..] => {
            for path in paths {
                container.files.remove(&absolute(wd, path));
            }
            exit(0, "", "")
        }
        ["echo", words @ ..] => exit(0, format!("{}\n", words.join(" ")), ""),
        ["sh", "-c", "base64 -d > \"$1\"", "sh", path] => {
            if fail_base64 {
                exit(127, "", "sh: base64: not found")
            } else {
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(&stdin)
                    .expect("stdin is base64");
                container.files.insert(
                    absolute(wd, path),
                    String::from_utf8(decoded).expect("decoded utf-8"),
                );
                exit(0, "", "")
            }
        }
        ["sh", "-c", "cat > \"$1\"", "sh", path] => {
            if fail_inline {
                exit(1, "", format!("sh: {path}: Read-only file system"))
            } else {
                container.files.insert(
                    absolute(wd, path),
                    String::from_utf8(stdin).expect("stdin utf-8"),
                );
                exit(0, "", "")
            }
        }
        ["sh", "-c", script] => match script.strip_prefix("echo ") {
            Some(text) => exit(0, format!("{text}\n"), ""),
            None => exit(127, "", format!("sh: {script}: not found")),
        },
        ["iverilog", "-o", artifact, source, testbench] => {
            let missing = [source, testbench]
                .into_iter()
                .find(|f| !container.files.contains_key(&absolute(wd, f)));
            if let Some(file) = missing {
                exit(2, "", format!("{file}: No such file or directory"))
            } else {
                if compile.exit_code == 0 {
                    container
                        .files
                        .insert(absolute(wd, artifact), "#! vvp".to_string());
                }
                exit(compile.exit_code, compile.stdout, compile.stderr)
            }
        }
        ["vvp", artifact] => {
            if container.files.contains_key(&absolute(wd, artifact)) {
                if simulate.exit_code == 0
                    && let Some(dump) = dump
                {
                    container
                        .files
                        .insert(absolute(wd, "waveform.vcd"), dump);
                }
                exit(simulate.exit_code, simulate.stdout, simulate.stderr)
            } else {
                exit(1, "", format!("{artifact}: Unable to open input file."))
            }
        }
        [program, ..] => exit(127, "", format!("sh: {program}: not found")),
        [] => return Err(failed("exec", "no command")),
    };
    Ok(output)
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn find(&self, name: &str) -> Result<Option<ContainerInfo>, EngineError> {
        Ok(self.with(|s| {
            s.containers
                .iter()
                .find(|(_, c)| c.name == name && c.state != ContainerState::Removed)
                .map(|(id, c)| ContainerInfo {
                    id: id.clone(),
                    name: c.name.clone(),
                    state: c.state,
                })
        }))
    }

    async fn create(&self, spec: &CreateSpec) -> Result<String, EngineError> {
        self.with(|s| {
            if s.fail_create {
                return Err(failed("create", "Unable to find image"));
            }
            s.next_id += 1;
            let id = format!("mock{:04}", s.next_id);
            s.containers.insert(
                id.clone(),
                Container {
                    name: spec.name.clone(),
                    state: ContainerState::Created,
                    pending_polls: 0,
                    bind: spec.bind.clone(),
                    dirs: BTreeSet::from([spec.workdir.clone()]),
                    files: BTreeMap::new(),
                },
            );
            Ok(id)
        })
    }

    async fn start(&self, id: &str) -> Result<(), EngineError> {
        self.with(|s| {
            let (lag, never) = (s.start_lag, s.never_runs);
            let container = Self::container(s, id)?;
            if !never {
                container.pending_polls = lag;
                container.state = ContainerState::Running;
            }
            Ok(())
        })
    }

    async fn state(&self, id: &str) -> Result<ContainerState, EngineError> {
        self.with(|s| {
            let container = Self::container(s, id)?;
            if container.pending_polls > 0 {
                container.pending_polls -= 1;
                return Ok(ContainerState::Created);
            }
            Ok(container.state)
        })
    }

    async fn stop(&self, id: &str) -> Result<(), EngineError> {
        self.with(|s| {
            if s.fail_stop {
                return Err(failed("stop", "daemon timeout"));
            }
            Self::container(s, id)?.state = ContainerState::Stopped;
            Ok(())
        })
    }

    async fn remove(&self, id: &str) -> Result<(), EngineError> {
        self.with(|s| {
            if s.fail_remove {
                return Err(failed("rm", "removal already in progress"));
            }
            let container = Self::container(s, id)?;
            if container.state == ContainerState::Running {
                return Err(failed("rm", "cannot remove a running container"));
            }
            container.state = ContainerState::Removed;
            Ok(())
        })
    }

    async fn exec(&self, id: &str, request: &ExecRequest) -> Result<ExecOutput, EngineError> {
        let delay = self.with(|s| {
            s.execs.push(request.argv.clone());
            s.exec_delay
        });
        if let Some(delay) = delay {
            match request.timeout {
                Some(timeout) if timeout < delay => {
                    tokio::time::sleep(timeout).await;
                    return Err(EngineError::TimedOut(timeout));
                }
                _ => tokio::time::sleep(delay).await,
            }
        }
        self.with(|s| run(s, id, request))
    }

    async fn copy_archive(
        &self,
        id: &str,
        dest_dir: &str,
        archive: Vec<u8>,
    ) -> Result<(), EngineError> {
        self.with(|s| {
            s.archives += 1;
            if s.fail_archive {
                return Err(failed("cp", "archive copy is not supported"));
            }
            let container = Self::container(s, id)?;
            let mut tar = tar::Archive::new(archive.as_slice());
            for entry in tar.entries().expect("tar entries") {
                let mut entry = entry.expect("tar entry");
                let name = entry.path().expect("entry path").display().to_string();
                let mut content = String::new();
                entry.read_to_string(&mut content).expect("utf-8 entry");
                container
                    .files
                    .insert(format!("{}/{name}", dest_dir.trim_end_matches('/')), content);
            }
            Ok(())
        })
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.with(|s| {
            if s.fail_close {
                return Err(failed("close", "client already closed"));
            }
            s.closed = true;
            Ok(())
        })
    }
}
