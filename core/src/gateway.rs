//! Privileged helper invocation.
//!
//! Every privileged operation goes through [`HelperGateway`], which runs the
//! fixed helper executable behind an authorization-prompting wrapper
//! (`pkexec` by default). The helper understands four verbs: `list`,
//! `up NAME`, `down NAME` and `status NAME`.
//!
//! Tunnel names are always passed as separate argv entries and validated
//! first, so a hostile config file name can never turn into an option or a
//! shell fragment.

use std::fmt;
use std::sync::Arc;

use log::{debug, warn};

use crate::platform::CommandRunner;
use crate::runner::CommandOutput;

/// Marker printed by `status` when the tunnel is down.
pub const INACTIVE_MARKER: &str = "inactive";

/// Line prefixes (lowercase) that carry key material.
const SECRET_PREFIXES: [&str; 2] = ["private key", "preshared key"];

/// Longest interface name the kernel accepts (IFNAMSIZ - 1).
const MAX_NAME_LEN: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperVerb {
    List,
    Up(String),
    Down(String),
    Status(String),
}

impl HelperVerb {
    fn args(&self) -> Vec<String> {
        match self {
            HelperVerb::List => vec!["list".to_string()],
            HelperVerb::Up(name) => vec!["up".to_string(), name.clone()],
            HelperVerb::Down(name) => vec!["down".to_string(), name.clone()],
            HelperVerb::Status(name) => vec!["status".to_string(), name.clone()],
        }
    }

    fn tunnel(&self) -> Option<&str> {
        match self {
            HelperVerb::List => None,
            HelperVerb::Up(name) | HelperVerb::Down(name) | HelperVerb::Status(name) => Some(name),
        }
    }
}

impl fmt::Display for HelperVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.args().join(" "))
    }
}

/// Result of a `status` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelStatus {
    Inactive,
    Up(StatusBlock),
}

/// One line of `status` output, split on the first `:`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub indent: String,
    pub key: Option<String>,
    pub value: String,
}

/// Redacted `status` output. Secret lines never make it in here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusBlock {
    lines: Vec<StatusLine>,
}

impl StatusBlock {
    pub fn lines(&self) -> &[StatusLine] {
        &self.lines
    }

    /// Human-readable text for the stats display.
    pub fn render(&self) -> String {
        self.lines
            .iter()
            .map(|line| match &line.key {
                Some(key) => format!("{}{}: {}", line.indent, key, line.value),
                None => format!("{}{}", line.indent, line.value),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// True if the line carries private or preshared key material.
pub fn is_secret_line(line: &str) -> bool {
    let lowered = line.trim().to_lowercase();
    SECRET_PREFIXES.iter().any(|prefix| lowered.starts_with(prefix))
}

/// Parse `status` stdout, dropping blank and secret lines. Output with
/// nothing left to show counts as inactive.
pub fn parse_status(stdout: &str) -> TunnelStatus {
    if stdout.trim() == INACTIVE_MARKER {
        return TunnelStatus::Inactive;
    }

    let lines = stdout
        .lines()
        .filter(|line| !line.trim().is_empty() && !is_secret_line(line))
        .map(|line| {
            let body = line.trim_start();
            let indent = line[..line.len() - body.len()].to_string();
            let body = body.trim_end();
            match body.split_once(':') {
                Some((key, value)) => StatusLine {
                    indent,
                    key: Some(key.trim().to_string()),
                    value: value.trim().to_string(),
                },
                None => StatusLine {
                    indent,
                    key: None,
                    value: body.to_string(),
                },
            }
        })
        .collect::<Vec<_>>();

    if lines.is_empty() {
        return TunnelStatus::Inactive;
    }
    TunnelStatus::Up(StatusBlock { lines })
}

/// Parse `list` stdout into tunnel names, in order, without blanks or
/// duplicates.
pub fn parse_config_list(stdout: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for name in stdout.lines().map(str::trim).filter(|s| !s.is_empty()) {
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

/// Check that `name` is usable as an interface name and safe as an argument.
pub fn validate_tunnel_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("empty tunnel name".to_string());
    }
    if name.len() > MAX_NAME_LEN {
        return Err(format!(
            "tunnel name '{name}' is longer than {MAX_NAME_LEN} characters"
        ));
    }
    if name.starts_with('-') {
        return Err(format!("tunnel name '{name}' must not start with '-'"));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '=' | '+' | '.' | '-')))
    {
        return Err(format!("tunnel name '{name}' contains invalid character {bad:?}"));
    }
    Ok(())
}

/// Invokes the privileged helper.
#[derive(Clone)]
pub struct HelperGateway {
    runner: Arc<dyn CommandRunner>,
    escalation: String,
    helper: String,
}

impl HelperGateway {
    /// `escalation` may be empty to call the helper directly.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        escalation: impl Into<String>,
        helper: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            escalation: escalation.into(),
            helper: helper.into(),
        }
    }

    /// Program and argv used for `verb`.
    pub fn command_line(&self, verb: &HelperVerb) -> (String, Vec<String>) {
        if self.escalation.is_empty() {
            (self.helper.clone(), verb.args())
        } else {
            let mut args = vec![self.helper.clone()];
            args.extend(verb.args());
            (self.escalation.clone(), args)
        }
    }

    /// Run a verb. Invalid tunnel names fail without running anything.
    pub fn invoke(&self, verb: &HelperVerb) -> CommandOutput {
        if let Some(name) = verb.tunnel()
            && let Err(e) = validate_tunnel_name(name)
        {
            warn!("Refusing helper call '{}': {}", verb, e);
            return CommandOutput::failed(e);
        }

        let (program, args) = self.command_line(verb);
        debug!("Helper call: {}", verb);
        let out = self.runner.run(&program, &args);
        if !out.success {
            warn!("Helper call '{}' failed: {}", verb, out.stderr.trim());
        }
        out
    }

    /// Configured tunnel names. `Err` carries the helper's diagnostic.
    pub fn list(&self) -> Result<Vec<String>, String> {
        let out = self.invoke(&HelperVerb::List);
        if out.success {
            Ok(parse_config_list(&out.stdout))
        } else {
            Err(out.stderr)
        }
    }

    /// Bring a tunnel up or down.
    pub fn set_state(&self, name: &str, enable: bool) -> CommandOutput {
        let verb = if enable {
            HelperVerb::Up(name.to_string())
        } else {
            HelperVerb::Down(name.to_string())
        };
        self.invoke(&verb)
    }

    /// Redacted status of a tunnel.
    pub fn status(&self, name: &str) -> Result<TunnelStatus, String> {
        let out = self.invoke(&HelperVerb::Status(name.to_string()));
        if out.success {
            Ok(parse_status(&out.stdout))
        } else {
            Err(out.stderr)
        }
    }
}
