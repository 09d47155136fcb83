//! Unprivileged view of live tunnel interfaces.
//! Lists interfaces of the tunnel device type with `ip -o link show type ...`.

use std::collections::BTreeSet;
use std::sync::Arc;

use log::{debug, warn};

use crate::platform::CommandRunner;

#[derive(Clone)]
pub struct InterfaceObserver {
    runner: Arc<dyn CommandRunner>,
    program: String,
    device_type: String,
}

impl InterfaceObserver {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        program: impl Into<String>,
        device_type: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            program: program.into(),
            device_type: device_type.into(),
        }
    }

    pub fn command_line(&self) -> (String, Vec<String>) {
        let args = ["-o", "link", "show", "type", self.device_type.as_str()]
            .iter()
            .map(|s| s.to_string())
            .collect();
        (self.program.clone(), args)
    }

    /// Names of the interfaces that are up right now. An empty set is a
    /// normal answer; `Err` means the listing command itself failed.
    pub fn active_interfaces(&self) -> Result<BTreeSet<String>, String> {
        let (program, args) = self.command_line();
        let out = self.runner.run(&program, &args);
        if !out.success {
            warn!("Interface listing failed: {}", out.stderr.trim());
            return Err(out.stderr);
        }
        let names = parse_link_list(&out.stdout);
        debug!("Live {} interfaces: {:?}", self.device_type, names);
        Ok(names)
    }
}

/// Parse `ip -o link` output. Each line looks like
/// `7: wg0: <POINTOPOINT,NOARP,UP,LOWER_UP> mtu 1420 ...` or
/// `8: wg1@NONE: ...`; only the bare name is kept. Lines that do not
/// match are skipped.
pub fn parse_link_list(stdout: &str) -> BTreeSet<String> {
    stdout.lines().filter_map(parse_link_line).collect()
}

fn parse_link_line(line: &str) -> Option<String> {
    let (index, rest) = line.trim_start().split_once(':')?;
    if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let rest = rest.trim_start();
    let end = rest.find(['@', ':'])?;
    let name = &rest[..end];
    if name.is_empty() || name.contains(char::is_whitespace) {
        return None;
    }
    Some(name.to_string())
}
