//! The fixed remediation catalog
//!
//! Every drift check maps to exactly one remediation action, and every action
//! is backed by exactly one handler in the `ActionRegistry`. Handlers produce
//! per-OS runbooks; the engine decides when each step runs.
//!
//! Scripts are templates with `{{name}}` placeholders filled from the
//! handler's defaults, overridden by rule or request parameters.

use super::transport::TargetOs;
use crate::drift::CheckKind;
use crate::error::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Bump whenever a runbook's scripts change
pub const CATALOG_VERSION: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationAction {
    ApplyPatches,
    RestartEndpointProtection,
    RunBackup,
    RestartLogService,
    RestoreFirewallBaseline,
    EnableVolumeEncryption,
}

impl RemediationAction {
    pub const ALL: [RemediationAction; 6] = [
        RemediationAction::ApplyPatches,
        RemediationAction::RestartEndpointProtection,
        RemediationAction::RunBackup,
        RemediationAction::RestartLogService,
        RemediationAction::RestoreFirewallBaseline,
        RemediationAction::EnableVolumeEncryption,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RemediationAction::ApplyPatches => "apply_patches",
            RemediationAction::RestartEndpointProtection => "restart_endpoint_protection",
            RemediationAction::RunBackup => "run_backup",
            RemediationAction::RestartLogService => "restart_log_service",
            RemediationAction::RestoreFirewallBaseline => "restore_firewall_baseline",
            RemediationAction::EnableVolumeEncryption => "enable_volume_encryption",
        }
    }

    /// Stable identifier recorded in evidence and L1 rules
    pub fn runbook_id(self) -> &'static str {
        match self {
            RemediationAction::ApplyPatches => "RB-PATCH-001",
            RemediationAction::RestartEndpointProtection => "RB-EDR-001",
            RemediationAction::RunBackup => "RB-BACKUP-001",
            RemediationAction::RestartLogService => "RB-LOG-001",
            RemediationAction::RestoreFirewallBaseline => "RB-FW-001",
            RemediationAction::EnableVolumeEncryption => "RB-ENC-001",
        }
    }

    pub fn from_runbook_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.runbook_id() == id)
    }

    /// Default remediation for a failing check
    pub fn for_check(check: CheckKind) -> Self {
        match check {
            CheckKind::Patching => RemediationAction::ApplyPatches,
            CheckKind::EndpointProtection => RemediationAction::RestartEndpointProtection,
            CheckKind::Backup => RemediationAction::RunBackup,
            CheckKind::Logging => RemediationAction::RestartLogService,
            CheckKind::Firewall => RemediationAction::RestoreFirewallBaseline,
            CheckKind::Encryption => RemediationAction::EnableVolumeEncryption,
        }
    }
}

impl fmt::Display for RemediationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RemediationAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.name() == s || a.runbook_id() == s)
            .ok_or_else(|| format!("unknown remediation action: {}", s))
    }
}

/// Rendered scripts for one action on one OS
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runbook {
    pub id: String,
    pub action: RemediationAction,
    pub pre_health: Option<String>,
    pub execute: String,
    pub post_health: String,
    pub rollback: Option<String>,
}

pub trait ActionHandler: Send + Sync {
    fn action(&self) -> RemediationAction;

    /// Parameter defaults; every placeholder in every template must have one
    fn defaults(&self) -> &BTreeMap<String, String>;

    fn runbook(&self, os: TargetOs, overrides: &BTreeMap<String, String>) -> Result<Runbook>;
}

#[derive(Debug, Clone)]
struct OsScripts {
    pre_health: Option<&'static str>,
    execute: &'static str,
    post_health: &'static str,
    rollback: Option<&'static str>,
}

/// Template-backed handler with one script set per OS
#[derive(Debug, Clone)]
pub struct ScriptedHandler {
    action: RemediationAction,
    linux: OsScripts,
    windows: OsScripts,
    defaults: BTreeMap<String, String>,
}

impl ScriptedHandler {
    fn scripts(&self, os: TargetOs) -> &OsScripts {
        match os {
            TargetOs::Linux => &self.linux,
            TargetOs::Windows => &self.windows,
        }
    }
}

impl ActionHandler for ScriptedHandler {
    fn action(&self) -> RemediationAction {
        self.action
    }

    fn defaults(&self) -> &BTreeMap<String, String> {
        &self.defaults
    }

    fn runbook(&self, os: TargetOs, overrides: &BTreeMap<String, String>) -> Result<Runbook> {
        let mut params = self.defaults.clone();
        for (key, value) in overrides {
            if self.defaults.contains_key(key) {
                params.insert(key.clone(), value.clone());
            }
        }
        let scripts = self.scripts(os);
        let render = |t: &str| render_template(t, &params);
        Ok(Runbook {
            id: self.action.runbook_id().to_string(),
            action: self.action,
            pre_health: scripts.pre_health.map(render).transpose()?,
            execute: render(scripts.execute)?,
            post_health: render(scripts.post_health)?,
            rollback: scripts.rollback.map(render).transpose()?,
        })
    }
}

/// Placeholder names used in a template
pub fn placeholders(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                names.push(after[..end].to_string());
                rest = &after[end + 2..];
            }
            None => break,
        }
    }
    names
}

pub fn render_template(template: &str, params: &BTreeMap<String, String>) -> Result<String> {
    let mut out = template.to_string();
    for name in placeholders(template) {
        let value = params.get(&name).ok_or_else(|| {
            WardenError::Registry(format!("runbook parameter {{{{{}}}}} has no value", name))
        })?;
        if !is_safe_parameter(value) {
            return Err(WardenError::Registry(format!(
                "runbook parameter {} has unsafe value {:?}",
                name, value
            )));
        }
        out = out.replace(&format!("{{{{{}}}}}", name), value);
    }
    Ok(out)
}

/// Parameters are service names, paths, units; never shell syntax
fn is_safe_parameter(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@' | '\\'))
}

fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn builtin_handlers() -> Vec<ScriptedHandler> {
    vec![
        ScriptedHandler {
            action: RemediationAction::ApplyPatches,
            linux: OsScripts {
                pre_health: Some("df --output=avail -k / | tail -1 | awk '$1 > 1048576 { ok=1 } END { exit !ok }'"),
                execute: "if command -v apt-get >/dev/null; then DEBIAN_FRONTEND=noninteractive apt-get -qq update && DEBIAN_FRONTEND=noninteractive apt-get -y -qq upgrade; else dnf -y -q upgrade --security; fi && date -u +%s > {{patch_stamp}}",
                post_health: "test -s {{patch_stamp}} && ! systemctl --failed --no-legend | grep -q .",
                // Package upgrades are not reversible in place
                rollback: None,
            },
            windows: OsScripts {
                pre_health: Some("if ((Get-PSDrive C).Free -lt 2GB) { exit 1 }"),
                execute: "$s = New-Object -ComObject Microsoft.Update.Session; $r = $s.CreateUpdateSearcher().Search('IsInstalled=0 and Type=''Software'''); if ($r.Updates.Count -gt 0) { $d = $s.CreateUpdateDownloader(); $d.Updates = $r.Updates; $d.Download() | Out-Null; $i = $s.CreateUpdateInstaller(); $i.Updates = $r.Updates; if ($i.Install().ResultCode -ne 2) { exit 1 } }",
                post_health: "$s = New-Object -ComObject Microsoft.Update.Session; if ($s.CreateUpdateSearcher().Search('IsInstalled=0 and Type=''Software''').Updates.Count -gt 0) { exit 1 }",
                rollback: None,
            },
            defaults: params(&[("patch_stamp", "/var/lib/warden/last_patch")]),
        },
        ScriptedHandler {
            action: RemediationAction::RestartEndpointProtection,
            linux: OsScripts {
                pre_health: Some("systemctl cat {{edr_service}} >/dev/null"),
                execute: "systemctl restart {{edr_service}}",
                post_health: "systemctl is-active --quiet {{edr_service}}",
                rollback: None,
            },
            windows: OsScripts {
                pre_health: Some("Get-Service -Name {{edr_service_windows}} -ErrorAction Stop | Out-Null"),
                execute: "Restart-Service -Name {{edr_service_windows}} -Force -ErrorAction Stop",
                post_health: "if ((Get-Service -Name {{edr_service_windows}}).Status -ne 'Running') { exit 1 }",
                rollback: None,
            },
            defaults: params(&[
                ("edr_service", "clamav-daemon"),
                ("edr_service_windows", "WinDefend"),
            ]),
        },
        ScriptedHandler {
            action: RemediationAction::RunBackup,
            linux: OsScripts {
                pre_health: Some("systemctl cat {{backup_unit}} >/dev/null"),
                execute: "systemctl start --wait {{backup_unit}}",
                post_health: "test $(( $(date +%s) - $(stat -c %Y {{backup_stamp}}) )) -lt 3600",
                rollback: None,
            },
            windows: OsScripts {
                pre_health: Some("Get-Command wbadmin -ErrorAction Stop | Out-Null"),
                execute: "wbadmin start backup -backupTarget:{{backup_target}} -allCritical -quiet; if ($LASTEXITCODE -ne 0) { exit $LASTEXITCODE }",
                post_health: "$v = wbadmin get versions | Select-String 'Backup time'; if (-not $v) { exit 1 }",
                rollback: None,
            },
            defaults: params(&[
                ("backup_unit", "backup.service"),
                ("backup_stamp", "/var/lib/warden/last_backup"),
                ("backup_target", "E:"),
            ]),
        },
        ScriptedHandler {
            action: RemediationAction::RestartLogService,
            linux: OsScripts {
                pre_health: None,
                execute: "systemctl restart {{log_service}}",
                post_health: "systemctl is-active --quiet {{log_service}}",
                rollback: None,
            },
            windows: OsScripts {
                pre_health: None,
                execute: "Restart-Service -Name {{log_service_windows}} -Force -ErrorAction Stop",
                post_health: "if ((Get-Service -Name {{log_service_windows}}).Status -ne 'Running') { exit 1 }",
                rollback: None,
            },
            defaults: params(&[
                ("log_service", "auditd"),
                ("log_service_windows", "EventLog"),
            ]),
        },
        ScriptedHandler {
            action: RemediationAction::RestoreFirewallBaseline,
            linux: OsScripts {
                pre_health: Some("command -v nft >/dev/null && test -r {{firewall_baseline}}"),
                execute: "nft list ruleset > {{firewall_snapshot}} && nft -c -f {{firewall_baseline}} && nft flush ruleset && nft -f {{firewall_baseline}}",
                post_health: "nft list ruleset | grep -q 'table inet filter'",
                rollback: Some("nft flush ruleset && nft -f {{firewall_snapshot}}"),
            },
            windows: OsScripts {
                pre_health: Some("if (-not (Test-Path {{firewall_baseline_windows}})) { exit 1 }"),
                execute: "netsh advfirewall export {{firewall_snapshot_windows}} | Out-Null; netsh advfirewall import {{firewall_baseline_windows}}; if ($LASTEXITCODE -ne 0) { exit $LASTEXITCODE }",
                post_health: "if ((Get-NetFirewallProfile | Where-Object { -not $_.Enabled }).Count -gt 0) { exit 1 }",
                rollback: Some("netsh advfirewall import {{firewall_snapshot_windows}}; if ($LASTEXITCODE -ne 0) { exit $LASTEXITCODE }"),
            },
            defaults: params(&[
                ("firewall_baseline", "/etc/warden/firewall.nft"),
                ("firewall_snapshot", "/var/lib/warden/firewall.rollback.nft"),
                ("firewall_baseline_windows", "C:\\ProgramData\\Warden\\firewall.wfw"),
                ("firewall_snapshot_windows", "C:\\ProgramData\\Warden\\firewall.rollback.wfw"),
            ]),
        },
        ScriptedHandler {
            action: RemediationAction::EnableVolumeEncryption,
            linux: OsScripts {
                pre_health: Some("grep -q '^{{crypt_volume}} ' /etc/crypttab"),
                execute: "cryptsetup status {{crypt_volume}} >/dev/null || systemctl start systemd-cryptsetup@{{crypt_volume}}.service",
                post_health: "cryptsetup status {{crypt_volume}} | grep -q 'is active'",
                rollback: None,
            },
            windows: OsScripts {
                pre_health: Some("if ((Get-Tpm).TpmReady -ne $true) { exit 1 }"),
                execute: "Enable-BitLocker -MountPoint {{bitlocker_volume}} -EncryptionMethod XtsAes256 -UsedSpaceOnly -TpmProtector -ErrorAction Stop | Out-Null",
                post_health: "if ((Get-BitLockerVolume -MountPoint {{bitlocker_volume}}).VolumeStatus -eq 'FullyDecrypted') { exit 1 }",
                rollback: Some("Disable-BitLocker -MountPoint {{bitlocker_volume}} -ErrorAction Stop | Out-Null"),
            },
            defaults: params(&[
                ("crypt_volume", "luks-root"),
                ("bitlocker_volume", "C:"),
            ]),
        },
    ]
}

/// Action → handler map, validated once at startup
#[derive(Default)]
pub struct ActionRegistry {
    handlers: HashMap<RemediationAction, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in handler set, already validated
    pub fn builtin() -> Result<Self> {
        let mut registry = Self::new();
        for handler in builtin_handlers() {
            registry.register(Arc::new(handler))?;
        }
        registry.validate()?;
        Ok(registry)
    }

    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) -> Result<()> {
        let action = handler.action();
        if self.handlers.contains_key(&action) {
            return Err(WardenError::Registry(format!(
                "duplicate handler for {}",
                action
            )));
        }
        self.handlers.insert(action, handler);
        Ok(())
    }

    /// Every action has a handler and every handler renders with its defaults
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = RemediationAction::ALL
            .iter()
            .filter(|a| !self.handlers.contains_key(*a))
            .map(|a| a.name())
            .collect();
        if !missing.is_empty() {
            return Err(WardenError::Registry(format!(
                "no handler for: {}",
                missing.join(", ")
            )));
        }
        for handler in self.handlers.values() {
            for os in [TargetOs::Linux, TargetOs::Windows] {
                handler.runbook(os, &BTreeMap::new())?;
            }
        }
        Ok(())
    }

    pub fn get(&self, action: RemediationAction) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(&action).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_covers_every_action() {
        let registry = ActionRegistry::builtin().unwrap();
        assert_eq!(registry.len(), RemediationAction::ALL.len());
        for check in CheckKind::ALL {
            assert!(registry.get(RemediationAction::for_check(check)).is_some());
        }
    }

    #[test]
    fn test_validate_reports_missing_handlers() {
        let mut registry = ActionRegistry::new();
        registry
            .register(Arc::new(builtin_handlers().remove(0)))
            .unwrap();
        let err = registry.validate().unwrap_err().to_string();
        assert!(err.contains("run_backup"));
        assert!(!err.contains("apply_patches"));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ActionRegistry::builtin().unwrap();
        let again = builtin_handlers().remove(1);
        assert!(registry.register(Arc::new(again)).is_err());
    }

    #[test]
    fn test_runbook_renders_overrides() {
        let registry = ActionRegistry::builtin().unwrap();
        let handler = registry.get(RemediationAction::RestartLogService).unwrap();
        let overrides = params(&[("log_service", "rsyslog"), ("unrelated", "x")]);
        let runbook = handler.runbook(TargetOs::Linux, &overrides).unwrap();
        assert_eq!(runbook.execute, "systemctl restart rsyslog");
        assert_eq!(runbook.id, "RB-LOG-001");
        assert!(runbook.rollback.is_none());
    }

    #[test]
    fn test_unsafe_parameter_rejected() {
        let registry = ActionRegistry::builtin().unwrap();
        let handler = registry.get(RemediationAction::RestartLogService).unwrap();
        let overrides = params(&[("log_service", "auditd; rm -rf /")]);
        assert!(handler.runbook(TargetOs::Linux, &overrides).is_err());
    }

    #[test]
    fn test_firewall_has_rollback_on_both_platforms() {
        let registry = ActionRegistry::builtin().unwrap();
        let handler = registry.get(RemediationAction::RestoreFirewallBaseline).unwrap();
        for os in [TargetOs::Linux, TargetOs::Windows] {
            assert!(handler.runbook(os, &BTreeMap::new()).unwrap().rollback.is_some());
        }
    }

    #[test]
    fn test_action_lookup() {
        assert_eq!(
            RemediationAction::from_runbook_id("RB-FW-001"),
            Some(RemediationAction::RestoreFirewallBaseline)
        );
        assert_eq!("run_backup".parse::<RemediationAction>().unwrap(), RemediationAction::RunBackup);
        assert!("reboot".parse::<RemediationAction>().is_err());
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders("a {{x}} b {{y}}"), vec!["x", "y"]);
        assert!(placeholders("if ($a) { exit 1 }").is_empty());
    }
}
