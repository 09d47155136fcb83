//! Tunnel state reconciliation (platform-agnostic).
//!
//! The [`Engine`] owns the known configs, the active set and the in-flight
//! guards. Helper and observer calls run on background threads; their
//! results come back as [`EngineInput::Completed`] messages on the engine's
//! inbox, and the shell feeds that inbox into [`Engine::handle`] from a
//! single loop. Engine state is therefore only ever touched from one thread.
//!
//! Presentation updates are queued as [`EngineEvent`]s and collected with
//! [`Engine::drain_events`].

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::mpsc::Sender;

use chrono::{DateTime, Local};
use log::{debug, info, warn};

use crate::gateway::{HelperGateway, TunnelStatus};
use crate::observer::InterfaceObserver;
use crate::runner::{self, CommandOutput};

const NOTIFY_TITLE: &str = "WireGuard";
const NOTIFY_ERROR_TITLE: &str = "WireGuard Error";

/// Why a poll cycle was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollReason {
    Timer,
    /// Explicit refresh from the shell, e.g. the menu was opened.
    Poke,
    AfterToggle,
}

/// Messages consumed by [`Engine::handle`].
#[derive(Debug)]
pub enum EngineInput {
    Poll(PollReason),
    Completed(Completion),
}

/// Result of a background job. Only the engine creates these.
#[derive(Debug)]
pub struct Completion(Finished);

#[derive(Debug)]
enum Finished {
    Discovered(Result<Vec<String>, String>),
    Observed(Result<BTreeSet<String>, String>),
    Rediscovered {
        live: BTreeSet<String>,
        listing: Result<Vec<String>, String>,
    },
    Toggled {
        name: String,
        enable: bool,
        was_active: bool,
        output: CommandOutput,
    },
    StatsFetched {
        name: String,
        status: Result<TunnelStatus, String>,
    },
}

enum Job {
    Discover,
    Observe,
    Rediscover { live: BTreeSet<String> },
    Toggle { name: String, enable: bool, was_active: bool },
    Stats { name: String },
}

impl Job {
    fn execute(self, gateway: &HelperGateway, observer: &InterfaceObserver) -> Finished {
        match self {
            Job::Discover => Finished::Discovered(gateway.list()),
            Job::Observe => Finished::Observed(observer.active_interfaces()),
            Job::Rediscover { live } => Finished::Rediscovered {
                live,
                listing: gateway.list(),
            },
            Job::Toggle {
                name,
                enable,
                was_active,
            } => {
                let output = gateway.set_state(&name, enable);
                Finished::Toggled {
                    name,
                    enable,
                    was_active,
                    output,
                }
            }
            Job::Stats { name } => {
                let status = gateway.status(&name);
                Finished::StatsFetched { name, status }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Error,
}

/// Updates for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The tunnel list changed; rebuild from [`Engine::snapshot`].
    ConfigsChanged,
    ActiveStateChanged { name: String, active: bool },
    /// `None` hides the stats display.
    StatsUpdated { name: String, text: Option<String> },
    ToggleStarted { name: String },
    ToggleFinished { name: String, success: bool },
    Notify {
        severity: Severity,
        title: String,
        body: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelView {
    pub name: String,
    pub active: bool,
    /// A toggle is in flight; the control should be disabled.
    pub busy: bool,
    pub stats: Option<String>,
}

/// Read-only copy of the engine state for rendering.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub tunnels: Vec<TunnelView>,
    pub any_active: bool,
    pub last_poll: Option<DateTime<Local>>,
    /// False until the first full menu build was signalled.
    pub ready: bool,
}

pub struct Engine {
    gateway: HelperGateway,
    observer: InterfaceObserver,
    inbox: Sender<EngineInput>,
    notifications: bool,

    known_configs: Vec<String>,
    active: BTreeSet<String>,
    transitioning: HashSet<String>,
    fetching: HashSet<String>,
    stats: HashMap<String, String>,
    /// Config list at the last `ConfigsChanged`.
    presented: Option<Vec<String>>,

    discovering: bool,
    discovered: bool,
    polling: bool,
    poll_queued: bool,
    in_flight: usize,
    last_poll: Option<DateTime<Local>>,

    events: Vec<EngineEvent>,
}

impl Engine {
    /// `inbox` must feed back into [`Engine::handle`].
    pub fn new(
        gateway: HelperGateway,
        observer: InterfaceObserver,
        inbox: Sender<EngineInput>,
        notifications: bool,
    ) -> Self {
        Self {
            gateway,
            observer,
            inbox,
            notifications,
            known_configs: Vec::new(),
            active: BTreeSet::new(),
            transitioning: HashSet::new(),
            fetching: HashSet::new(),
            stats: HashMap::new(),
            presented: None,
            discovering: false,
            discovered: false,
            polling: false,
            poll_queued: false,
            in_flight: 0,
            last_poll: None,
            events: Vec::new(),
        }
    }

    /// Discover configs, then run the first poll cycle.
    pub fn start(&mut self) {
        info!("Starting tunnel engine");
        self.discover();
    }

    /// Re-run the helper's `list` and follow up with a full poll.
    pub fn discover(&mut self) {
        if self.discovering {
            debug!("Discovery already running");
            return;
        }
        self.discovering = true;
        self.spawn(Job::Discover);
    }

    pub fn set_notifications(&mut self, enabled: bool) {
        if self.notifications != enabled {
            info!("Notifications {}", if enabled { "enabled" } else { "disabled" });
        }
        self.notifications = enabled;
    }

    pub fn handle(&mut self, input: EngineInput) {
        match input {
            EngineInput::Poll(reason) => self.request_poll(reason),
            EngineInput::Completed(Completion(finished)) => {
                self.in_flight = self.in_flight.saturating_sub(1);
                self.complete(finished);
            }
        }
    }

    /// Start a poll cycle, or queue one if a cycle or discovery is running.
    pub fn request_poll(&mut self, reason: PollReason) {
        if self.discovering || !self.discovered || self.polling {
            debug!("Poll ({:?}) queued", reason);
            self.poll_queued = true;
            return;
        }
        debug!("Poll ({:?}) started", reason);
        self.begin_poll();
    }

    /// Ask the helper to bring `name` up or down. Returns `false` if a
    /// toggle for `name` is already in flight, in which case nothing happens.
    pub fn toggle(&mut self, name: &str, enable: bool) -> bool {
        if self.transitioning.contains(name) {
            debug!("Ignoring toggle for {}: already in transition", name);
            return false;
        }

        let was_active = self.active.contains(name);
        info!("Bringing {} {}", name, if enable { "up" } else { "down" });

        self.transitioning.insert(name.to_string());
        self.events.push(EngineEvent::ToggleStarted {
            name: name.to_string(),
        });
        self.spawn(Job::Toggle {
            name: name.to_string(),
            enable,
            was_active,
        });
        true
    }

    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn snapshot(&self) -> Snapshot {
        let tunnels = self
            .known_configs
            .iter()
            .map(|name| TunnelView {
                name: name.clone(),
                active: self.active.contains(name),
                busy: self.transitioning.contains(name),
                stats: self.stats.get(name).cloned(),
            })
            .collect();

        Snapshot {
            tunnels,
            any_active: !self.active.is_empty(),
            last_poll: self.last_poll,
            ready: self.presented.is_some(),
        }
    }

    pub fn known_configs(&self) -> &[String] {
        &self.known_configs
    }

    pub fn active_set(&self) -> &BTreeSet<String> {
        &self.active
    }

    pub fn is_transitioning(&self, name: &str) -> bool {
        self.transitioning.contains(name)
    }

    pub fn is_fetching(&self, name: &str) -> bool {
        self.fetching.contains(name)
    }

    pub fn is_polling(&self) -> bool {
        self.polling
    }

    pub fn stats_text(&self, name: &str) -> Option<&str> {
        self.stats.get(name).map(String::as_str)
    }

    /// Background jobs whose completion has not been handled yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    fn spawn(&mut self, job: Job) {
        self.in_flight += 1;
        let gateway = self.gateway.clone();
        let observer = self.observer.clone();
        let inbox = self.inbox.clone();
        runner::run_async(
            move || job.execute(&gateway, &observer),
            move |finished| {
                if inbox
                    .send(EngineInput::Completed(Completion(finished)))
                    .is_err()
                {
                    debug!("Engine inbox closed; dropping job result");
                }
            },
        );
    }

    fn begin_poll(&mut self) {
        self.polling = true;
        self.poll_queued = false;
        self.spawn(Job::Observe);
    }

    fn finish_poll(&mut self) {
        self.polling = false;
        if self.poll_queued {
            debug!("Running queued poll");
            self.begin_poll();
        }
    }

    fn complete(&mut self, finished: Finished) {
        match finished {
            Finished::Discovered(listing) => self.on_discovered(listing),
            Finished::Observed(live) => self.on_observed(live),
            Finished::Rediscovered { live, listing } => self.on_rediscovered(live, listing),
            Finished::Toggled {
                name,
                enable,
                was_active,
                output,
            } => self.on_toggled(name, enable, was_active, output),
            Finished::StatsFetched { name, status } => self.on_stats(name, status),
        }
    }

    fn on_discovered(&mut self, listing: Result<Vec<String>, String>) {
        self.discovering = false;
        self.discovered = true;

        match listing {
            Ok(names) if names.is_empty() && !self.known_configs.is_empty() => {
                warn!("Config discovery listed nothing, keeping previous list");
            }
            Ok(names) => {
                info!("Discovered {} tunnel configs", names.len());
                self.known_configs = names;
            }
            Err(e) => warn!("Config discovery failed, keeping previous list: {}", e.trim()),
        }

        if self.polling {
            self.poll_queued = true;
        } else {
            self.begin_poll();
        }
    }

    fn on_observed(&mut self, live: Result<BTreeSet<String>, String>) {
        let live = match live {
            Ok(live) => live,
            Err(e) => {
                warn!("Skipping poll, interface state unavailable: {}", e.trim());
                self.finish_poll();
                return;
            }
        };

        let unknown: Vec<&String> = live
            .iter()
            .filter(|name| !self.known_configs.contains(name))
            .collect();
        if !unknown.is_empty() {
            info!("Unknown live interfaces {:?}; re-discovering configs", unknown);
            self.spawn(Job::Rediscover { live });
            return;
        }

        self.apply(live);
        self.finish_poll();
    }

    fn on_rediscovered(&mut self, live: BTreeSet<String>, listing: Result<Vec<String>, String>) {
        match listing {
            Ok(names) if names.is_empty() => {
                warn!("Re-discovery listed nothing, keeping previous list");
            }
            Ok(names) => self.known_configs = names,
            Err(e) => warn!("Re-discovery failed: {}", e.trim()),
        }

        // A live interface counts as a tunnel even without a visible config.
        for name in &live {
            if !self.known_configs.contains(name) {
                info!("Adding {} from live interface state", name);
                self.known_configs.push(name.clone());
            }
        }

        self.apply(live);
        self.finish_poll();
    }

    /// Diff `live` against the active set and replace it. Only a poll that
    /// reaches here counts as a check.
    fn apply(&mut self, live: BTreeSet<String>) {
        self.last_poll = Some(Local::now());
        let rebuild = self.presented.as_ref() != Some(&self.known_configs);

        for name in &self.known_configs {
            let was_active = self.active.contains(name);
            let is_active = live.contains(name);
            if was_active == is_active {
                continue;
            }

            debug!("{} is now {}", name, if is_active { "up" } else { "down" });
            let hidden = !is_active && self.stats.remove(name).is_some();
            if !rebuild {
                self.events.push(EngineEvent::ActiveStateChanged {
                    name: name.clone(),
                    active: is_active,
                });
                if hidden {
                    self.events.push(EngineEvent::StatsUpdated {
                        name: name.clone(),
                        text: None,
                    });
                }
            }
        }

        self.active = live;
        let active = &self.active;
        self.stats.retain(|name, _| active.contains(name));

        if rebuild {
            info!("Tunnel list changed: {:?}", self.known_configs);
            self.presented = Some(self.known_configs.clone());
            self.events.push(EngineEvent::ConfigsChanged);
        }

        let names: Vec<String> = self.active.iter().cloned().collect();
        for name in names {
            self.fetch_stats(name);
        }
    }

    fn fetch_stats(&mut self, name: String) {
        if self.fetching.contains(&name) {
            debug!("Stats for {} already being fetched", name);
            return;
        }
        self.fetching.insert(name.clone());
        self.spawn(Job::Stats { name });
    }

    fn on_stats(&mut self, name: String, status: Result<TunnelStatus, String>) {
        self.fetching.remove(&name);

        let text = match status {
            Ok(TunnelStatus::Up(block)) if self.active.contains(&name) => Some(block.render()),
            Ok(TunnelStatus::Up(_)) => {
                debug!("Discarding stats for {}: no longer active", name);
                None
            }
            Ok(TunnelStatus::Inactive) => None,
            Err(e) => {
                debug!("Stats for {} unavailable: {}", name, e.trim());
                None
            }
        };

        match text {
            Some(text) => {
                if self.stats.get(&name) != Some(&text) {
                    self.stats.insert(name.clone(), text.clone());
                    self.events.push(EngineEvent::StatsUpdated {
                        name,
                        text: Some(text),
                    });
                }
            }
            None => {
                if self.stats.remove(&name).is_some() {
                    self.events.push(EngineEvent::StatsUpdated { name, text: None });
                }
            }
        }
    }

    fn on_toggled(&mut self, name: String, enable: bool, was_active: bool, output: CommandOutput) {
        self.transitioning.remove(&name);
        self.events.push(EngineEvent::ToggleFinished {
            name: name.clone(),
            success: output.success,
        });

        let action = if enable { "up" } else { "down" };
        if output.success {
            info!("{} is {}", name, action);
            let verb = if enable { "connected" } else { "disconnected" };
            self.notify(Severity::Info, NOTIFY_TITLE, format!("{name} {verb}"));
            self.request_poll(PollReason::AfterToggle);
        } else {
            warn!("Failed to bring {} {}: {}", name, action, output.stderr.trim());
            self.events.push(EngineEvent::ActiveStateChanged {
                name: name.clone(),
                active: was_active,
            });
            self.notify(
                Severity::Error,
                NOTIFY_ERROR_TITLE,
                format!("Failed to {action} {name}:\n{}", output.stderr.trim()),
            );
        }
    }

    fn notify(&mut self, severity: Severity, title: &str, body: String) {
        if !self.notifications {
            return;
        }
        self.events.push(EngineEvent::Notify {
            severity,
            title: title.to_string(),
            body,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{self, Receiver};
    use std::sync::{Arc, Condvar, Mutex};
    use std::time::Duration;

    use crate::platform::CommandRunner;

    const LIST: &str = "helper list";
    const IP: &str = "ip -o link show type wireguard";

    const STATUS_HOME: &str = "interface: home
  public key: kXc1cZ8Vb2c8Q3Yy0H4U3sE6vJ0V1yQm2pA6VQ2p5Hk=
  private key: yAnz5TF+lXXJte14tji3zlMNq+hd2rYUIgJBgB3fBmk=
  listening port: 51820

peer: xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=
  preshared key: ZWNyZXQta2V5LW1hdGVyaWFsLWhlcmUtMTIzNDU2Nzg=
  latest handshake: 12 seconds ago
  transfer: 5.10 KiB received, 7.32 KiB sent
";

    /// Scripted runner keyed by `program args...`.
    #[derive(Default)]
    struct FakeRunner {
        script: Mutex<HashMap<String, CommandOutput>>,
        calls: Mutex<Vec<String>>,
        held: Mutex<HashSet<String>>,
        gate: Condvar,
    }

    impl FakeRunner {
        fn set(&self, key: &str, output: CommandOutput) {
            self.script.lock().unwrap().insert(key.to_string(), output);
        }

        fn count(&self, key: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| *c == key).count()
        }

        fn hold(&self, key: &str) {
            self.held.lock().unwrap().insert(key.to_string());
        }

        fn release(&self, key: &str) {
            self.held.lock().unwrap().remove(key);
            self.gate.notify_all();
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(&self, program: &str, args: &[String]) -> CommandOutput {
            let key = format!("{} {}", program, args.join(" "));
            self.calls.lock().unwrap().push(key.clone());
            let mut held = self.held.lock().unwrap();
            while held.contains(&key) {
                held = self.gate.wait(held).unwrap();
            }
            drop(held);
            self.script
                .lock()
                .unwrap()
                .get(&key)
                .cloned()
                .unwrap_or_else(|| CommandOutput::failed(format!("unscripted: {key}")))
        }
    }

    struct Harness {
        fake: Arc<FakeRunner>,
        engine: Engine,
        rx: Receiver<EngineInput>,
    }

    impl Harness {
        fn new(list: &str, links: &str) -> Self {
            let fake = Arc::new(FakeRunner::default());
            fake.set(LIST, CommandOutput::ok(list));
            fake.set(IP, CommandOutput::ok(links));
            let gateway = HelperGateway::new(fake.clone(), "", "helper");
            let observer = InterfaceObserver::new(fake.clone(), "ip", "wireguard");
            let (tx, rx) = mpsc::channel();
            let engine = Engine::new(gateway, observer, tx, true);
            Self { fake, engine, rx }
        }

        fn started(list: &str, links: &str) -> Self {
            let mut h = Self::new(list, links);
            h.engine.start();
            h.settle();
            h
        }

        fn pump_one(&mut self) {
            let input = self
                .rx
                .recv_timeout(Duration::from_secs(5))
                .expect("engine stalled");
            self.engine.handle(input);
        }

        fn settle(&mut self) {
            while self.engine.in_flight() > 0 {
                self.pump_one();
            }
        }

        fn poll(&mut self) -> Vec<EngineEvent> {
            self.engine.drain_events();
            self.engine.handle(EngineInput::Poll(PollReason::Timer));
            self.settle();
            self.engine.drain_events()
        }
    }

    fn link(index: u32, name: &str) -> String {
        format!("{index}: {name}: <POINTOPOINT,NOARP,UP,LOWER_UP> mtu 1420 qdisc noqueue\n")
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn startup_discovers_and_marks_live_tunnels() {
        let mut h = Harness::new("home\noffice\n", &link(5, "home"));
        h.fake.set("helper status home", CommandOutput::ok(STATUS_HOME));
        h.engine.start();
        h.settle();

        assert_eq!(h.engine.known_configs(), names(&["home", "office"]).as_slice());
        assert_eq!(h.engine.active_set().len(), 1);
        assert!(h.engine.active_set().contains("home"));
        assert_eq!(h.fake.count("helper status home"), 1);
        assert_eq!(h.fake.count("helper status office"), 0);

        let events = h.engine.drain_events();
        assert_eq!(events[0], EngineEvent::ConfigsChanged);
        assert!(events.iter().any(|e| matches!(
            e,
            EngineEvent::StatsUpdated { name, text: Some(_) } if name == "home"
        )));

        let snapshot = h.engine.snapshot();
        assert!(snapshot.ready);
        assert!(snapshot.any_active);
        assert!(snapshot.last_poll.is_some());
        assert!(snapshot.tunnels[0].active);
        assert!(!snapshot.tunnels[1].active);
        assert_eq!(snapshot.tunnels[1].stats, None);
    }

    #[test]
    fn second_identical_poll_emits_nothing() {
        let mut h = Harness::new("home\noffice\n", &link(5, "home"));
        h.fake.set("helper status home", CommandOutput::ok(STATUS_HOME));
        h.engine.start();
        h.settle();

        h.poll();
        assert!(h.poll().is_empty());
        assert!(h.engine.stats_text("home").is_some());
    }

    #[test]
    fn stats_are_redacted() {
        let mut h = Harness::new("home\n", &link(5, "home"));
        h.fake.set("helper status home", CommandOutput::ok(STATUS_HOME));
        h.engine.start();
        h.settle();

        let text = h.engine.stats_text("home").expect("stats for home");
        assert!(text.contains("latest handshake: 12 seconds ago"));
        assert!(!text.contains("yAnz5TF"));
        assert!(!text.contains("ZWNyZXQta2V5"));
        for event in h.engine.drain_events() {
            if let EngineEvent::StatsUpdated { text: Some(text), .. } = event {
                assert!(!text.to_lowercase().contains("private key"));
                assert!(!text.to_lowercase().contains("preshared key"));
            }
        }
    }

    #[test]
    fn unknown_live_interface_is_adopted() {
        let h = Harness::started("home\n", &link(12, "roadwarrior"));

        assert_eq!(h.fake.count(LIST), 2);
        assert_eq!(
            h.engine.known_configs(),
            names(&["home", "roadwarrior"]).as_slice()
        );
        assert!(h.engine.active_set().contains("roadwarrior"));
        let snapshot = h.engine.snapshot();
        assert!(snapshot.tunnels.iter().any(|t| t.name == "roadwarrior" && t.active));
    }

    #[test]
    fn rediscovery_picks_up_new_config_and_rebuilds() {
        let mut h = Harness::started("home\n", "");
        h.fake.set(LIST, CommandOutput::ok("home\nlab\nroadwarrior\n"));
        h.fake.set(IP, CommandOutput::ok(link(12, "roadwarrior")));

        let events = h.poll();

        assert_eq!(
            h.engine.known_configs(),
            names(&["home", "lab", "roadwarrior"]).as_slice()
        );
        assert!(events.contains(&EngineEvent::ConfigsChanged));
        assert!(!events
            .iter()
            .any(|e| matches!(e, EngineEvent::ActiveStateChanged { .. })));
    }

    #[test]
    fn every_live_name_is_known_after_a_poll() {
        let live_sets: [&[&str]; 4] = [&[], &["home"], &["home", "x1"], &["y2", "z3"]];
        for live in live_sets {
            let links: String = live
                .iter()
                .enumerate()
                .map(|(i, n)| link(i as u32 + 3, n))
                .collect();
            let h = Harness::started("home\noffice\n", &links);
            for name in live {
                assert!(h.engine.known_configs().iter().any(|k| k == name));
            }
        }
    }

    #[test]
    fn interface_going_down_hides_stats() {
        let mut h = Harness::new("home\noffice\n", &link(5, "home"));
        h.fake.set("helper status home", CommandOutput::ok(STATUS_HOME));
        h.engine.start();
        h.settle();

        h.fake.set(IP, CommandOutput::ok(""));
        let events = h.poll();

        assert_eq!(
            events,
            vec![
                EngineEvent::ActiveStateChanged {
                    name: "home".to_string(),
                    active: false,
                },
                EngineEvent::StatsUpdated {
                    name: "home".to_string(),
                    text: None,
                },
            ]
        );
        assert!(h.engine.active_set().is_empty());
        assert_eq!(h.engine.stats_text("home"), None);
    }

    #[test]
    fn inactive_marker_hides_stats() {
        let mut h = Harness::new("home\n", &link(5, "home"));
        h.fake.set("helper status home", CommandOutput::ok(STATUS_HOME));
        h.engine.start();
        h.settle();
        assert!(h.engine.stats_text("home").is_some());

        h.fake.set("helper status home", CommandOutput::ok("inactive\n"));
        let events = h.poll();
        assert_eq!(
            events,
            vec![EngineEvent::StatsUpdated {
                name: "home".to_string(),
                text: None,
            }]
        );
    }

    #[test]
    fn failed_observation_keeps_previous_state() {
        let mut h = Harness::started("home\n", &link(5, "home"));
        h.fake.set(IP, CommandOutput::failed("ip: command not found"));

        let events = h.poll();

        assert!(events.is_empty());
        assert!(h.engine.active_set().contains("home"));
        assert!(!h.engine.is_polling());
    }

    #[test]
    fn failed_observation_does_not_advance_last_checked() {
        let mut h = Harness::started("home\n", &link(5, "home"));
        let checked = h.engine.snapshot().last_poll;
        assert!(checked.is_some());

        std::thread::sleep(Duration::from_millis(20));
        h.fake.set(IP, CommandOutput::failed("ip: command not found"));
        h.poll();
        assert_eq!(h.engine.snapshot().last_poll, checked);

        h.fake.set(IP, CommandOutput::ok(link(5, "home")));
        h.poll();
        assert!(h.engine.snapshot().last_poll > checked);
    }

    #[test]
    fn empty_status_output_shows_no_stats() {
        let mut h = Harness::new("home\n", &link(5, "home"));
        h.fake.set("helper status home", CommandOutput::ok(""));
        h.engine.start();
        h.settle();

        assert!(h.engine.active_set().contains("home"));
        assert_eq!(h.engine.stats_text("home"), None);
        assert!(!h.engine.drain_events().iter().any(|e| matches!(
            e,
            EngineEvent::StatsUpdated { .. }
        )));

        h.fake.set("helper status home", CommandOutput::ok(STATUS_HOME));
        h.poll();
        assert!(h.engine.stats_text("home").is_some());

        h.fake.set("helper status home", CommandOutput::ok("\n"));
        let events = h.poll();
        assert_eq!(
            events,
            vec![EngineEvent::StatsUpdated {
                name: "home".to_string(),
                text: None,
            }]
        );
        assert_eq!(h.engine.stats_text("home"), None);
    }

    #[test]
    fn failed_status_call_hides_stats() {
        let mut h = Harness::new("home\n", &link(5, "home"));
        h.fake.set("helper status home", CommandOutput::ok(STATUS_HOME));
        h.engine.start();
        h.settle();
        assert!(h.engine.stats_text("home").is_some());

        h.fake.set(
            "helper status home",
            CommandOutput::failed("Error executing command as another user: Not authorized"),
        );
        let events = h.poll();

        assert_eq!(
            events,
            vec![EngineEvent::StatsUpdated {
                name: "home".to_string(),
                text: None,
            }]
        );
        assert_eq!(h.engine.stats_text("home"), None);
        assert!(h.engine.active_set().contains("home"));
    }

    #[test]
    fn concurrent_polls_are_coalesced() {
        let mut h = Harness::started("home\n", "");
        let before = h.fake.count(IP);

        h.engine.handle(EngineInput::Poll(PollReason::Timer));
        h.engine.handle(EngineInput::Poll(PollReason::Poke));
        h.engine.handle(EngineInput::Poll(PollReason::Poke));
        h.settle();

        assert_eq!(h.fake.count(IP), before + 2);
    }

    #[test]
    fn polls_before_discovery_wait_for_it() {
        let mut h = Harness::new("home\n", "");
        h.engine.handle(EngineInput::Poll(PollReason::Timer));
        assert_eq!(h.engine.in_flight(), 0);

        h.engine.start();
        h.settle();
        assert_eq!(h.fake.count(LIST), 1);
        assert_eq!(h.fake.count(IP), 1);
    }

    #[test]
    fn duplicate_toggle_is_ignored() {
        let mut h = Harness::started("home\noffice\n", &link(6, "office"));
        h.fake.set("helper down office", CommandOutput::ok(""));
        h.fake.hold("helper down office");

        assert!(h.engine.toggle("office", false));
        assert!(!h.engine.toggle("office", false));
        assert!(!h.engine.toggle("office", true));
        assert!(h.engine.is_transitioning("office"));
        assert!(h.engine.snapshot().tunnels[1].busy);

        h.fake.set(IP, CommandOutput::ok(""));
        h.fake.release("helper down office");
        h.settle();

        assert_eq!(h.fake.count("helper down office"), 1);
        assert_eq!(h.fake.count("helper up office"), 0);
        assert!(!h.engine.is_transitioning("office"));
        assert!(h.engine.toggle("office", true));
    }

    #[test]
    fn successful_toggle_notifies_and_repolls() {
        let mut h = Harness::started("home\noffice\n", "");
        h.fake.set("helper up home", CommandOutput::ok(""));
        h.fake.set("helper status home", CommandOutput::ok(STATUS_HOME));
        h.fake.set(IP, CommandOutput::ok(link(5, "home")));
        h.engine.drain_events();
        let polls_before = h.fake.count(IP);

        h.engine.toggle("home", true);
        h.settle();

        let events = h.engine.drain_events();
        assert_eq!(
            events[0],
            EngineEvent::ToggleStarted {
                name: "home".to_string()
            }
        );
        assert_eq!(
            events[1],
            EngineEvent::ToggleFinished {
                name: "home".to_string(),
                success: true,
            }
        );
        assert!(events.contains(&EngineEvent::Notify {
            severity: Severity::Info,
            title: "WireGuard".to_string(),
            body: "home connected".to_string(),
        }));
        assert!(events.contains(&EngineEvent::ActiveStateChanged {
            name: "home".to_string(),
            active: true,
        }));
        assert_eq!(h.fake.count(IP), polls_before + 1);
        assert!(h.engine.stats_text("home").is_some());
    }

    #[test]
    fn failed_toggle_reverts_control() {
        let mut h = Harness::started("home\noffice\n", "");
        h.fake.set(
            "helper up home",
            CommandOutput::failed("RTNETLINK answers: Operation not permitted\n"),
        );
        h.engine.drain_events();
        let polls_before = h.fake.count(IP);

        h.engine.toggle("home", true);
        h.settle();

        let events = h.engine.drain_events();
        assert!(events.contains(&EngineEvent::ToggleFinished {
            name: "home".to_string(),
            success: false,
        }));
        assert!(events.contains(&EngineEvent::ActiveStateChanged {
            name: "home".to_string(),
            active: false,
        }));
        assert!(events.contains(&EngineEvent::Notify {
            severity: Severity::Error,
            title: "WireGuard Error".to_string(),
            body: "Failed to up home:\nRTNETLINK answers: Operation not permitted".to_string(),
        }));
        assert_eq!(h.fake.count(IP), polls_before);
        assert!(!h.engine.is_transitioning("home"));
        assert!(!h.engine.snapshot().tunnels[0].active);
    }

    #[test]
    fn disabled_notifications_are_not_emitted() {
        let mut h = Harness::started("home\n", "");
        h.engine.set_notifications(false);
        h.fake.set("helper up home", CommandOutput::failed("boom"));
        h.engine.drain_events();

        h.engine.toggle("home", true);
        h.settle();

        assert!(!h
            .engine
            .drain_events()
            .iter()
            .any(|e| matches!(e, EngineEvent::Notify { .. })));
    }

    #[test]
    fn stats_fetch_is_not_duplicated() {
        let mut h = Harness::new("home\n", &link(5, "home"));
        h.fake.set("helper status home", CommandOutput::ok(STATUS_HOME));
        h.fake.hold("helper status home");
        h.engine.start();
        while !(h.engine.is_fetching("home") && !h.engine.is_polling()) {
            h.pump_one();
        }

        h.engine.handle(EngineInput::Poll(PollReason::Poke));
        while h.engine.is_polling() {
            h.pump_one();
        }
        assert_eq!(h.fake.count("helper status home"), 1);

        h.fake.release("helper status home");
        h.settle();
        assert_eq!(h.fake.count("helper status home"), 1);
        assert!(!h.engine.is_fetching("home"));
        assert!(h.engine.stats_text("home").is_some());
    }

    #[test]
    fn failed_discovery_keeps_previous_configs() {
        let mut h = Harness::started("home\noffice\n", "");
        h.fake.set(LIST, CommandOutput::failed("Request dismissed"));

        h.engine.discover();
        h.settle();

        assert_eq!(h.engine.known_configs(), names(&["home", "office"]).as_slice());
    }

    #[test]
    fn empty_listing_keeps_previous_configs() {
        let mut h = Harness::started("home\noffice\n", "");
        h.fake.set(LIST, CommandOutput::ok(""));

        h.engine.discover();
        h.settle();
        assert_eq!(h.engine.known_configs(), names(&["home", "office"]).as_slice());

        // Drift re-discovery with an empty listing only adds the live name.
        h.fake.set(IP, CommandOutput::ok(link(9, "roadwarrior")));
        h.poll();
        assert_eq!(
            h.engine.known_configs(),
            names(&["home", "office", "roadwarrior"]).as_slice()
        );
        assert!(h.engine.active_set().contains("roadwarrior"));
    }
}
