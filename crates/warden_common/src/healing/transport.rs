//! Command transports for remediation
//!
//! SSH for Linux targets, WinRM for Windows targets, a local shell for the
//! appliance itself. Every call is bounded by an explicit timeout and comes
//! back as data: `Ok(ExecOutput)` for exit 0, otherwise an `ExecError`
//! whose kind is `Timeout`, `NonZeroExit` or `Transport`.

use crate::types::{ExecError, ExecErrorKind};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, warn};

pub type ExecResult = std::result::Result<ExecOutput, ExecError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetOs {
    Linux,
    Windows,
}

/// A managed host reachable by the appliance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub hostname: String,
    pub address: String,
    pub os: TargetOs,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub port: Option<u16>,
    /// WinRM password or SSH identity file, depending on transport
    #[serde(default, skip_serializing)]
    pub credential: Option<String>,
    /// Run through the local shell instead of a remote transport
    #[serde(default)]
    pub local: bool,
}

impl Target {
    pub fn local(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            address: "127.0.0.1".to_string(),
            os: TargetOs::Linux,
            username: String::new(),
            port: None,
            credential: None,
            local: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run a script to completion; callers bound this with `run_bounded`
    async fn execute(&self, target: &Target, script: &str) -> ExecResult;
}

/// Run on an independent task with a hard timeout
pub async fn run_bounded(
    executor: Arc<dyn RemoteExecutor>,
    target: &Target,
    script: &str,
    timeout: Duration,
) -> ExecResult {
    let target_owned = target.clone();
    let script_owned = script.to_string();
    let name = executor.name();

    let handle = tokio::spawn(async move {
        tokio::time::timeout(timeout, executor.execute(&target_owned, &script_owned)).await
    });

    match handle.await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => {
            warn!("{} on {} timed out after {:?}", name, target.hostname, timeout);
            Err(ExecError::new(
                ExecErrorKind::Timeout,
                format!("{} timed out after {}s", name, timeout.as_secs()),
            ))
        }
        Err(e) => Err(ExecError::new(
            ExecErrorKind::Transport,
            format!("{} worker failed: {}", name, e),
        )),
    }
}

fn finish(stdout: String, stderr: String, exit_code: i32, started: Instant) -> ExecResult {
    if exit_code == 0 {
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    } else {
        Err(ExecError::non_zero(exit_code, &stderr))
    }
}

// ============================================================================
// Executor selection
// ============================================================================

/// One executor per transport, chosen by target OS
#[derive(Clone)]
pub struct ExecutorSet {
    pub linux: Arc<dyn RemoteExecutor>,
    pub windows: Arc<dyn RemoteExecutor>,
    pub local: Arc<dyn RemoteExecutor>,
}

impl ExecutorSet {
    pub fn standard(winrm_use_tls: bool) -> Self {
        Self {
            linux: Arc::new(SshExecutor::default()),
            windows: Arc::new(WinRmExecutor::new(winrm_use_tls)),
            local: Arc::new(LocalExecutor),
        }
    }

    /// Same executor for every target (tests, single-transport sites)
    pub fn uniform(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self {
            linux: Arc::clone(&executor),
            windows: Arc::clone(&executor),
            local: executor,
        }
    }

    pub fn for_target(&self, target: &Target) -> Arc<dyn RemoteExecutor> {
        if target.local {
            return Arc::clone(&self.local);
        }
        match target.os {
            TargetOs::Linux => Arc::clone(&self.linux),
            TargetOs::Windows => Arc::clone(&self.windows),
        }
    }
}

// ============================================================================
// Local shell
// ============================================================================

pub struct LocalExecutor;

#[async_trait]
impl RemoteExecutor for LocalExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn execute(&self, _target: &Target, script: &str) -> ExecResult {
        let started = Instant::now();
        let output = Command::new("sh")
            .arg("-c")
            .arg(script)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ExecError::new(ExecErrorKind::Transport, format!("cannot spawn sh: {}", e)))?;

        finish(
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
            output.status.code().unwrap_or(-1),
            started,
        )
    }
}

// ============================================================================
// SSH
// ============================================================================

/// OpenSSH client in batch mode
pub struct SshExecutor {
    connect_timeout_secs: u64,
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
        }
    }
}

/// ssh reserves exit status 255 for its own errors
const SSH_TRANSPORT_EXIT: i32 = 255;

impl SshExecutor {
    fn args(&self, target: &Target, script: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-o".to_string(),
            "StrictHostKeyChecking=yes".to_string(),
            "-p".to_string(),
            target.port.unwrap_or(22).to_string(),
        ];
        if let Some(identity) = &target.credential {
            args.push("-i".to_string());
            args.push(identity.clone());
        }
        let destination = if target.username.is_empty() {
            target.address.clone()
        } else {
            format!("{}@{}", target.username, target.address)
        };
        args.push(destination);
        args.push("--".to_string());
        args.push(script.to_string());
        args
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    fn name(&self) -> &'static str {
        "ssh"
    }

    async fn execute(&self, target: &Target, script: &str) -> ExecResult {
        let started = Instant::now();
        debug!("ssh {}: {}", target.hostname, script);
        let output = Command::new("ssh")
            .args(self.args(target, script))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ExecError::new(ExecErrorKind::Transport, format!("cannot spawn ssh: {}", e)))?;

        let code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if code == SSH_TRANSPORT_EXIT {
            return Err(ExecError::new(ExecErrorKind::Transport, stderr.trim().to_string()));
        }
        finish(String::from_utf8_lossy(&output.stdout).into_owned(), stderr, code, started)
    }
}

// ============================================================================
// WinRM
// ============================================================================

const WSMAN_SHELL_URI: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";
const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const COMMAND_DONE: &str = "CommandState/Done";

/// WS-Management shell over HTTP(S) with basic auth, running PowerShell
pub struct WinRmExecutor {
    client: reqwest::Client,
    use_tls: bool,
}

impl WinRmExecutor {
    pub fn new(use_tls: bool) -> Self {
        Self {
            client: reqwest::Client::new(),
            use_tls,
        }
    }

    fn endpoint(&self, target: &Target) -> String {
        let (scheme, default_port) = if self.use_tls { ("https", 5986) } else { ("http", 5985) };
        format!(
            "{}://{}:{}/wsman",
            scheme,
            target.address,
            target.port.unwrap_or(default_port)
        )
    }

    async fn post(&self, target: &Target, envelope: String) -> Result<String, ExecError> {
        let response = self
            .client
            .post(self.endpoint(target))
            .basic_auth(&target.username, target.credential.as_deref())
            .header("Content-Type", "application/soap+xml;charset=UTF-8")
            .body(envelope)
            .send()
            .await
            .map_err(|e| ExecError::new(ExecErrorKind::Transport, format!("winrm: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExecError::new(ExecErrorKind::Transport, format!("winrm body: {}", e)))?;
        if !status.is_success() {
            return Err(ExecError::new(
                ExecErrorKind::Transport,
                format!("winrm HTTP {}: {}", status, extract(&body, r"<s:Text[^>]*>([^<]*)</s:Text>").unwrap_or_default()),
            ));
        }
        Ok(body)
    }
}

fn envelope(endpoint: &str, action: &str, shell_id: Option<&str>, body: &str) -> String {
    let selector = shell_id
        .map(|id| format!(r#"<w:SelectorSet><w:Selector Name="ShellId">{}</w:Selector></w:SelectorSet>"#, id))
        .unwrap_or_default();
    format!(
        r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:a="http://schemas.xmlsoap.org/ws/2004/08/addressing" xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd" xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell"><s:Header><a:To>{endpoint}</a:To><a:ReplyTo><a:Address s:mustUnderstand="true">http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address></a:ReplyTo><w:ResourceURI s:mustUnderstand="true">{uri}</w:ResourceURI><a:Action s:mustUnderstand="true">{action}</a:Action><a:MessageID>uuid:{id}</a:MessageID><w:OperationTimeout>PT60S</w:OperationTimeout>{selector}</s:Header><s:Body>{body}</s:Body></s:Envelope>"#,
        endpoint = endpoint,
        uri = WSMAN_SHELL_URI,
        action = action,
        id = uuid::Uuid::new_v4(),
        selector = selector,
        body = body,
    )
}

fn extract(body: &str, pattern: &str) -> Option<String> {
    Regex::new(pattern)
        .ok()?
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// PowerShell `-EncodedCommand` form: base64 of UTF-16LE
pub fn encode_powershell(script: &str) -> String {
    let utf16: Vec<u8> = script.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
    BASE64.encode(utf16)
}

/// Decoded stdout/stderr chunks, command-done flag and exit code
pub fn parse_receive(body: &str) -> (String, String, bool, Option<i32>) {
    let mut stdout = String::new();
    let mut stderr = String::new();
    let stream = Regex::new(r#"<rsp:Stream[^>]*Name="(stdout|stderr)"[^>]*>([^<]*)</rsp:Stream>"#);
    for cap in stream.iter().flat_map(|re| re.captures_iter(body)) {
        let decoded = BASE64.decode(cap[2].trim()).unwrap_or_default();
        let text = String::from_utf8_lossy(&decoded);
        if &cap[1] == "stdout" {
            stdout.push_str(&text);
        } else {
            stderr.push_str(&text);
        }
    }
    let done = body.contains(COMMAND_DONE);
    let exit_code = extract(body, r"<rsp:ExitCode>(-?\d+)</rsp:ExitCode>").and_then(|c| c.parse().ok());
    (stdout, stderr, done, exit_code)
}

#[async_trait]
impl RemoteExecutor for WinRmExecutor {
    fn name(&self) -> &'static str {
        "winrm"
    }

    async fn execute(&self, target: &Target, script: &str) -> ExecResult {
        let started = Instant::now();
        let endpoint = self.endpoint(target);
        debug!("winrm {}: {}", target.hostname, script);

        let create = envelope(
            &endpoint,
            ACTION_CREATE,
            None,
            "<rsp:Shell><rsp:InputStreams>stdin</rsp:InputStreams><rsp:OutputStreams>stdout stderr</rsp:OutputStreams></rsp:Shell>",
        );
        let body = self.post(target, create).await?;
        let shell_id = extract(&body, r#"<w:Selector Name="ShellId">([^<]+)</w:Selector>"#)
            .or_else(|| extract(&body, r"<rsp:ShellId>([^<]+)</rsp:ShellId>"))
            .ok_or_else(|| ExecError::new(ExecErrorKind::Transport, "winrm: no ShellId in response"))?;

        let result = self.run_in_shell(target, &endpoint, &shell_id, script, started).await;

        // Shell cleanup is best-effort; the command outcome stands either way
        let delete = envelope(&endpoint, ACTION_DELETE, Some(&shell_id), "");
        if let Err(e) = self.post(target, delete).await {
            debug!("winrm shell delete failed on {}: {}", target.hostname, e);
        }
        result
    }
}

impl WinRmExecutor {
    async fn run_in_shell(
        &self,
        target: &Target,
        endpoint: &str,
        shell_id: &str,
        script: &str,
        started: Instant,
    ) -> ExecResult {
        let command = envelope(
            endpoint,
            ACTION_COMMAND,
            Some(shell_id),
            &format!(
                "<rsp:CommandLine><rsp:Command>powershell.exe</rsp:Command><rsp:Arguments>-NoProfile -NonInteractive -EncodedCommand {}</rsp:Arguments></rsp:CommandLine>",
                encode_powershell(script)
            ),
        );
        let body = self.post(target, command).await?;
        let command_id = extract(&body, r"<rsp:CommandId>([^<]+)</rsp:CommandId>")
            .ok_or_else(|| ExecError::new(ExecErrorKind::Transport, "winrm: no CommandId in response"))?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        loop {
            let receive = envelope(
                endpoint,
                ACTION_RECEIVE,
                Some(shell_id),
                &format!(
                    r#"<rsp:Receive><rsp:DesiredStream CommandId="{}">stdout stderr</rsp:DesiredStream></rsp:Receive>"#,
                    command_id
                ),
            );
            let body = self.post(target, receive).await?;
            let (out, err, done, exit_code) = parse_receive(&body);
            stdout.push_str(&out);
            stderr.push_str(&err);
            if done {
                return finish(stdout, stderr, exit_code.unwrap_or(-1), started);
            }
        }
    }
}
