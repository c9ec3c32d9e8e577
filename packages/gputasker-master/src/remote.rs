//! SSH plumbing: agent bootstrap (push / start / stop / restart) and the
//! detached workload launch.
//!
//! Every remote command travels as a single argv argument to `ssh` and is
//! never re-parsed by a local shell, so user command text needs no local
//! escaping. Here-doc payloads are base64-wrapped to survive remote quoting.

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

use crate::config::{MasterConfig, PushAgentMode};
use crate::models::{format_gpu_list, Node};
use gputasker_protocol::parse_marker;

/// Remote filesystem layout under `~/.gputasker/` on every node.
pub const REMOTE_BASE_DIR: &str = "~/.gputasker";
pub const REMOTE_AGENT_PATH: &str = "~/.gputasker/agent/gputasker-agent";
pub const REMOTE_PID_PATH: &str = "~/.gputasker/gpu_agent.json";
pub const REMOTE_LOG_PATH: &str = "~/.gputasker/gpu_agent.log";
pub const REMOTE_ENV_PATH: &str = "~/.gputasker/agent.env";
pub const REMOTE_TASKS_DIR: &str = "~/.gputasker/running_tasks";

#[derive(Debug, Clone)]
pub struct SshTarget {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub private_key_path: Option<String>,
    pub timeout: Duration,
}

impl SshTarget {
    pub fn for_node(config: &MasterConfig, node: &Node) -> Self {
        Self {
            user: config.ssh_user.clone(),
            host: node.address.clone(),
            port: node.ssh_port,
            private_key_path: config.ssh_private_key_path.clone(),
            timeout: config.ssh_timeout,
        }
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            // Operational concession; see the deployment notes in DESIGN.md.
            "StrictHostKeyChecking=no".to_string(),
            "-p".to_string(),
            self.port.to_string(),
        ];
        if let Some(key) = &self.private_key_path {
            args.push("-i".to_string());
            args.push(key.clone());
        }
        args.push(format!("{}@{}", self.user, self.host));
        args
    }
}

/// Run one remote command, capture stdout. Non-zero exit is an error
/// carrying whatever the remote printed.
pub async fn ssh_run(target: &SshTarget, remote_cmd: &str) -> Result<String> {
    ssh_run_with_stdin(target, remote_cmd, None).await
}

async fn ssh_run_with_stdin(
    target: &SshTarget,
    remote_cmd: &str,
    stdin_bytes: Option<&[u8]>,
) -> Result<String> {
    let mut cmd = Command::new("ssh");
    cmd.args(target.base_args())
        .arg(remote_cmd)
        .stdin(if stdin_bytes.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn ssh")?;
    if let Some(bytes) = stdin_bytes {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("ssh stdin unavailable"))?;
        stdin.write_all(bytes).await?;
        stdin.shutdown().await?;
        drop(stdin);
    }

    let output = tokio::time::timeout(target.timeout, child.wait_with_output())
        .await
        .map_err(|_| anyhow!("ssh to {} timed out after {:?}", target.host, target.timeout))??;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if !output.status.success() {
        let detail = if !stderr.is_empty() { stderr } else { stdout };
        return Err(anyhow!(
            "ssh to {} failed rc={}: {}",
            target.host,
            output.status.code().unwrap_or(-1),
            if detail.is_empty() { "(no output)" } else { detail.as_str() }
        ));
    }
    Ok(stdout)
}

/// Wrap a Python program so it runs under `python3`, falling back to
/// `python`, fed through a quoted here-doc.
fn remote_python_heredoc(py_body: &str) -> String {
    format!(
        "(command -v python3 >/dev/null 2>&1 && PYBIN=python3 || PYBIN=python; \
         $PYBIN - <<'PY'\n{py_body}\nPY\n)"
    )
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// `hostname` on the node; used once at node registration.
pub async fn get_hostname(target: &SshTarget) -> Result<String> {
    let out = ssh_run(target, "hostname").await?;
    Ok(out.lines().next().unwrap_or("").trim().to_string())
}

// ===== Agent push =====

async fn remote_file_sha256(target: &SshTarget, path: &str) -> Result<Option<String>> {
    let payload = BASE64.encode(serde_json::json!({ "path": path }).to_string());
    let py_body = format!(
        r#"import base64, json, os, hashlib
p=json.loads(base64.b64decode('{payload}').decode('utf-8'))
path=os.path.expanduser(p['path'])
if not os.path.isfile(path):
    print('MISSING')
else:
    h=hashlib.sha256()
    with open(path,'rb') as f:
        for chunk in iter(lambda: f.read(1024*1024), b''):
            h.update(chunk)
    print('SHA256=' + h.hexdigest())"#
    );
    let out = ssh_run(target, &remote_python_heredoc(&py_body)).await?;
    match out.trim() {
        "MISSING" => Ok(None),
        line if line.starts_with("SHA256=") => Ok(Some(line[7..].trim().to_string())),
        other => Err(anyhow!("unexpected hash probe output: {}", other)),
    }
}

#[derive(Debug, Clone)]
pub struct PushOutcome {
    pub pushed: bool,
    pub remote_path: String,
}

/// Push the agent artifact, gated by content hash.
///
/// `missing` pushes only when the remote file is absent; `update` (default)
/// pushes when absent or different; `always` pushes unconditionally. A
/// failing remote hash probe falls through to a push so a half-written
/// remote copy heals itself.
pub async fn push_agent(
    target: &SshTarget,
    source: &[u8],
    mode: PushAgentMode,
) -> Result<PushOutcome> {
    let local_sha = sha256_hex(source);

    if mode != PushAgentMode::Always {
        match remote_file_sha256(target, REMOTE_AGENT_PATH).await {
            Ok(Some(remote_sha)) => {
                if remote_sha == local_sha {
                    return Ok(PushOutcome {
                        pushed: false,
                        remote_path: REMOTE_AGENT_PATH.to_string(),
                    });
                }
                if mode == PushAgentMode::Missing {
                    return Ok(PushOutcome {
                        pushed: false,
                        remote_path: REMOTE_AGENT_PATH.to_string(),
                    });
                }
            }
            Ok(None) => {}
            Err(err) => {
                log::warn!("⚠️  remote hash probe failed ({}); pushing anyway", err);
                if mode == PushAgentMode::Missing {
                    return Ok(PushOutcome {
                        pushed: false,
                        remote_path: REMOTE_AGENT_PATH.to_string(),
                    });
                }
            }
        }
    }

    let payload = BASE64.encode(serde_json::json!({ "path": REMOTE_AGENT_PATH }).to_string());
    // The artifact streams over stdin; an argv-embedded payload would hit
    // ARG_MAX for a real binary. Temp-file + rename keeps the write atomic.
    let py_body = format!(
        r#"import base64, json, os, sys, tempfile
p=json.loads(base64.b64decode('{payload}').decode('utf-8'))
path=os.path.expanduser(p['path'])
os.makedirs(os.path.dirname(path), exist_ok=True)
data=sys.stdin.buffer.read()
fd, tmp = tempfile.mkstemp(dir=os.path.dirname(path))
with os.fdopen(fd, 'wb') as f:
    f.write(data)
os.chmod(tmp, 0o755)
os.replace(tmp, path)
print('pushed ' + path)"#
    );
    ssh_run_with_stdin(target, &remote_python_heredoc(&py_body), Some(source)).await?;
    log::info!("📦 pushed agent to {} ({} bytes)", target.host, source.len());
    Ok(PushOutcome {
        pushed: true,
        remote_path: REMOTE_AGENT_PATH.to_string(),
    })
}

// ===== Agent start / stop =====

/// Start the agent on a node. The env file is rewritten with the current
/// server URL and token even when the agent is already up, so the master
/// can rotate its URL without a restart cycle.
pub async fn start_agent(
    target: &SshTarget,
    server_url: &str,
    token: &str,
    agent_source: Option<&[u8]>,
    push_mode: PushAgentMode,
) -> Result<String> {
    let agent_path = match agent_source {
        Some(source) => push_agent(target, source, push_mode).await?.remote_path,
        None => REMOTE_AGENT_PATH.to_string(),
    };

    let payload = BASE64.encode(
        serde_json::json!({
            "server_url": server_url,
            "token": token,
            "agent_path": agent_path,
            "base_dir": REMOTE_BASE_DIR,
            "pid_path": REMOTE_PID_PATH,
            "log_path": REMOTE_LOG_PATH,
            "env_path": REMOTE_ENV_PATH,
        })
        .to_string(),
    );

    let py_body = format!(
        r#"import base64, json, os, subprocess, sys, time
p = json.loads(base64.b64decode('{payload}').decode('utf-8'))
pid_path = os.path.expanduser(p['pid_path'])
log_path = os.path.expanduser(p['log_path'])
env_path = os.path.expanduser(p['env_path'])
agent_path = os.path.expanduser(p['agent_path'])
os.makedirs(os.path.dirname(pid_path), exist_ok=True)

def alive(x):
    try:
        os.kill(int(x), 0)
        return True
    except Exception:
        return False

pid = -1
if os.path.isfile(pid_path):
    try:
        d = json.load(open(pid_path))
        pid = int(d.get('pid', -1))
    except Exception:
        pid = -1

env = os.environ.copy()
env['GPUTASKER_SERVER_URL'] = p['server_url']
env['GPUTASKER_AGENT_TOKEN'] = p['token']

with open(env_path, 'w') as f:
    f.write('export GPUTASKER_SERVER_URL="%s"\n' % p['server_url'])
    f.write('export GPUTASKER_AGENT_TOKEN="%s"\n' % p['token'])

if pid > 0 and alive(pid):
    print('already_running pid=%d (env_updated)' % pid)
    raise SystemExit(0)

log = open(log_path, 'a', buffering=1)
proc = subprocess.Popen(
    ['nohup', agent_path],
    cwd=os.path.expanduser('~'),
    env=env,
    stdout=log,
    stderr=log,
    preexec_fn=os.setsid,
)
pgid = os.getpgid(proc.pid)
json.dump({{'pid': proc.pid, 'pgid': pgid, 'started_at': int(time.time())}}, open(pid_path, 'w'))
print('started pid=%d pgid=%d' % (proc.pid, pgid))"#
    );
    ssh_run(target, &remote_python_heredoc(&py_body)).await
}

/// Stop the agent via its PID file: SIGTERM to the process group, PID as
/// fallback, then unlink the PID file.
pub async fn stop_agent(target: &SshTarget) -> Result<String> {
    let payload = BASE64.encode(serde_json::json!({ "pid_path": REMOTE_PID_PATH }).to_string());
    let py_body = format!(
        r#"import base64, json, os, signal
p = json.loads(base64.b64decode('{payload}').decode('utf-8'))
pid_path = os.path.expanduser(p['pid_path'])

def alive(pid):
    try:
        os.kill(pid, 0)
        return True
    except Exception:
        return False

if not os.path.isfile(pid_path):
    print('not_running')
    raise SystemExit(0)

try:
    d = json.load(open(pid_path))
    pid = int(d.get('pid', -1))
    pgid = int(d.get('pgid', -1))
except Exception:
    pid = -1
    pgid = -1

killed = False
if pgid > 0:
    try:
        os.killpg(pgid, signal.SIGTERM)
        killed = True
    except Exception:
        pass
if (not killed) and pid > 0 and alive(pid):
    try:
        os.kill(pid, signal.SIGTERM)
        killed = True
    except Exception:
        pass

try:
    os.remove(pid_path)
except Exception:
    pass

print('stopped' if killed else 'not_running')"#
    );
    ssh_run(target, &remote_python_heredoc(&py_body)).await
}

pub async fn restart_agent(
    target: &SshTarget,
    server_url: &str,
    token: &str,
    agent_source: Option<&[u8]>,
    push_mode: PushAgentMode,
) -> Result<String> {
    stop_agent(target).await?;
    start_agent(target, server_url, token, agent_source, push_mode).await
}

// ===== Workload launch =====

/// Build the bash script the remote bootstrap will exec: GPU visibility,
/// the running-task metadata file (removed again on exit), then the user
/// command verbatim.
pub fn build_workload_script(gpus: &[u32], cmd: &str, run_log_id: i64) -> String {
    let mut script = format!("export CUDA_VISIBLE_DEVICES={}\n", format_gpu_list(gpus));
    if run_log_id > 0 {
        script.push_str(&format!(
            concat!(
                "META_DIR=\"$HOME/.gputasker/running_tasks\"\n",
                "mkdir -p \"$META_DIR\"\n",
                "META_PATH=\"$META_DIR/{id}.json\"\n",
                "REMOTE_PID=\"$$\"\n",
                "REMOTE_PGID=\"$(ps -o pgid= -p $$ | tr -d ' ')\"\n",
                "cat > \"$META_PATH\" <<EOF\n",
                "{{\"running_log_id\":{id},\"remote_pid\":\"$REMOTE_PID\",\"remote_pgid\":\"$REMOTE_PGID\",\"timestamp\":\"$(date +%s)\"}}\n",
                "EOF\n",
                "trap \"rm -f \\\"$META_PATH\\\"\" EXIT\n",
            ),
            id = run_log_id
        ));
    }
    script.push_str(cmd);
    if !script.ends_with('\n') {
        script.push('\n');
    }
    script
}

/// The remote command: cd into the workspace, then a Python bootstrap that
/// creates a new session, prints the marker line, and execs bash on the
/// decoded script. The interpreter is probed once so a failing workload is
/// never re-run by a fallback chain.
pub fn build_remote_command(script: &str, workspace: &str) -> String {
    let payload = BASE64.encode(script.as_bytes());
    let py_code = concat!(
        "import os,sys,base64; ",
        "os.setsid(); ",
        "script=base64.b64decode(sys.argv[1]).decode(\"utf-8\"); ",
        "print(\"__GPUTASKER_REMOTE__ pid=%d pgid=%d\" % (os.getpid(), os.getpgrp()), flush=True); ",
        "os.execv(\"/bin/bash\", [\"bash\",\"-lc\", script])",
    );
    format!(
        "cd {workspace} && (command -v python3 >/dev/null 2>&1 && PYBIN=python3 || PYBIN=python; \
         exec $PYBIN -c '{py_code}' {payload})"
    )
}

/// A workload running on a node inside its own session/process group,
/// supervised through the SSH child on the master.
pub struct RemoteGroup {
    child: Child,
    stdout: Option<BufReader<ChildStdout>>,
    log_path: PathBuf,
    drainer: Option<JoinHandle<()>>,
}

impl RemoteGroup {
    /// Spawn the SSH child. Stderr goes straight into the log file; stdout
    /// is held back for the marker line. No timeout applies here — a
    /// supervisor lives exactly as long as its workload.
    pub async fn launch(
        target: &SshTarget,
        gpus: &[u32],
        cmd: &str,
        workspace: &str,
        log_path: &Path,
        run_log_id: i64,
    ) -> Result<Self> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .with_context(|| format!("failed to open log file {}", log_path.display()))?;

        let script = build_workload_script(gpus, cmd, run_log_id);
        let remote_cmd = build_remote_command(&script, workspace);

        let mut child = Command::new("ssh")
            .args(target.base_args())
            .arg(remote_cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(log_file))
            .spawn()
            .context("failed to spawn ssh for workload")?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("ssh stdout unavailable"))?;

        Ok(Self {
            child,
            stdout: Some(BufReader::new(stdout)),
            log_path: log_path.to_path_buf(),
            drainer: None,
        })
    }

    pub fn local_pid(&self) -> i64 {
        self.child.id().map(|p| p as i64).unwrap_or(-1)
    }

    /// Synchronously read the first stdout line, parse the marker, then hand
    /// the rest of the stream to a background drainer that appends every
    /// line to the log file with a flush per line.
    pub async fn read_marker_and_stream(
        &mut self,
        first_line_timeout: Duration,
    ) -> (Option<i64>, Option<i64>) {
        let Some(mut reader) = self.stdout.take() else {
            return (None, None);
        };

        let mut first_line = String::new();
        let read = tokio::time::timeout(first_line_timeout, reader.read_line(&mut first_line)).await;
        let ids = match read {
            Ok(Ok(_)) => parse_marker(&first_line),
            _ => (None, None),
        };

        let log_path = self.log_path.clone();
        self.drainer = Some(tokio::spawn(async move {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .await;
            let mut file = match file {
                Ok(f) => f,
                Err(err) => {
                    log::error!("failed to open {} for streaming: {}", log_path.display(), err);
                    return;
                }
            };
            if !first_line.is_empty() {
                let _ = file.write_all(first_line.as_bytes()).await;
                if !first_line.ends_with('\n') {
                    let _ = file.write_all(b"\n").await;
                }
                let _ = file.flush().await;
            }
            let mut lines = reader.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if file.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                let _ = file.write_all(b"\n").await;
                let _ = file.flush().await;
            }
        }));

        ids
    }

    /// Block until the remote command exits; the drainer is joined so the
    /// log file holds the complete output before the status is reconciled.
    pub async fn wait(mut self) -> Result<i32> {
        let status = self.child.wait().await?;
        if let Some(drainer) = self.drainer.take() {
            let _ = drainer.await;
        }
        Ok(status.code().unwrap_or(-1))
    }
}

// ===== Targeted termination =====

/// TERM, pause, KILL against a remote process group.
pub async fn kill_remote_group(target: &SshTarget, pgid: i64) -> Result<()> {
    ssh_run(target, &format!("kill -TERM -{pgid} 2>/dev/null || true")).await?;
    tokio::time::sleep(Duration::from_secs(1)).await;
    ssh_run(target, &format!("kill -KILL -{pgid} 2>/dev/null || true")).await?;
    Ok(())
}

/// TERM, pause, KILL against a single remote PID (no group known).
pub async fn kill_remote_pid(target: &SshTarget, pid: i64) -> Result<()> {
    ssh_run(
        target,
        &format!("kill -TERM {pid} 2>/dev/null || true; sleep 1; kill -KILL {pid} 2>/dev/null || true"),
    )
    .await?;
    Ok(())
}
