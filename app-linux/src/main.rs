//! Linux tray shell for wg_manager.
//! Shows one switch per WireGuard tunnel with live stats underneath.

mod app;
mod menu;
mod notify;
mod paths;

use std::collections::HashMap;
use std::process::Command;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::thread;
use std::time::{Duration, Instant};

use gtk::glib;
use log::{info, warn};
use tray_icon::menu::MenuEvent;
use tray_icon::{Icon, TrayIcon, TrayIconBuilder};
use wg_manager_core::engine::{EngineEvent, Severity};
use wg_manager_core::platform::{AppPaths, Notifier};
use wg_manager_core::scheduler::format_last_poll;

use crate::app::AppState;
use crate::menu::{MenuAction, MenuHandles, build_id_lookup, build_menu, format_stats};
use crate::notify::DesktopNotifier;

const SETTINGS_CHECK: Duration = Duration::from_secs(2);

fn main() {
    env_logger::init();
    info!("starting wg_manager (linux tray)");

    gtk::init().expect("failed to init GTK"); // required for tray-icon on Linux

    let app_state = AppState::new();
    let running = Arc::new(AtomicBool::new(true));

    let (active_icon, idle_icon) = build_icons();
    let (menu, handles) = build_menu(&app_state.engine.snapshot());
    let id_lookup = build_id_lookup(&handles);

    let tray_icon = TrayIconBuilder::new()
        .with_menu(Box::new(menu))
        .with_icon(idle_icon.clone())
        .with_tooltip("WireGuard Manager")
        .build()
        .expect("failed to create tray icon");

    // Ctrl+C stops the loop; tunnels stay as they are.
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            info!("received signal, exiting");
            running.store(false, Ordering::SeqCst);
        })
        .expect("Error setting Ctrl-C handler");
    }

    let mut looper = EventLoop {
        tray_icon,
        handles,
        id_lookup,
        app_state,
        notifier: DesktopNotifier,
        active_icon,
        idle_icon,
        running,
        last_settings_check: Instant::now(),
    };

    looper.run();
}

struct EventLoop {
    tray_icon: TrayIcon,
    handles: MenuHandles,
    id_lookup: HashMap<muda::MenuId, MenuAction>,
    app_state: AppState,
    notifier: DesktopNotifier,
    active_icon: Icon,
    idle_icon: Icon,
    running: Arc<AtomicBool>,
    last_settings_check: Instant,
}

impl EventLoop {
    fn run(&mut self) {
        info!("tray icon ready; entering event loop");

        while self.running.load(Ordering::SeqCst) {
            // Process menu events (non-blocking)
            while let Ok(event) = MenuEvent::receiver().try_recv() {
                self.handle_menu_event(event.id);
            }

            if self.app_state.pump() {
                self.apply_engine_events();
            }

            if self.last_settings_check.elapsed() > SETTINGS_CHECK {
                self.app_state.reload_settings();
                self.last_settings_check = Instant::now();
            }

            glib::idle_add_local_once(|| {}); // allow GTK to process pending work
            while gtk::events_pending() {
                gtk::main_iteration_do(false);
            }

            thread::sleep(Duration::from_millis(50));
        }

        info!("exiting event loop; cleaning up");
        self.app_state.cleanup();
    }

    fn handle_menu_event(&mut self, id: muda::MenuId) {
        let Some(action) = self.id_lookup.get(&id).cloned() else {
            return;
        };

        match action {
            MenuAction::ToggleTunnel(name) => self.toggle_tunnel(&name),
            MenuAction::Refresh => {}
            MenuAction::Rescan => self.app_state.engine.discover(),
            MenuAction::OpenConfig => open_config(self.app_state.paths.as_ref()),
            MenuAction::Quit => {
                self.running.store(false, Ordering::SeqCst);
                return;
            }
        }

        // Any interaction counts as the menu being looked at.
        self.app_state.scheduler.poke();
        self.apply_engine_events();
    }

    fn toggle_tunnel(&mut self, name: &str) {
        let Some(handle) = self.handles.tunnels.iter().find(|h| h.name == name) else {
            return;
        };
        // The check item has already flipped itself.
        let desired = handle.item.is_checked();
        if !self.app_state.engine.toggle(name, desired) {
            let active = self.app_state.engine.active_set().contains(name);
            handle.item.set_checked(active);
        }
    }

    fn apply_engine_events(&mut self) {
        let mut rebuild = false;

        for event in self.app_state.engine.drain_events() {
            match event {
                EngineEvent::ConfigsChanged => rebuild = true,
                EngineEvent::ActiveStateChanged { name, active } => {
                    if let Some(handle) = self.handles.tunnels.iter().find(|h| h.name == name) {
                        handle.item.set_checked(active);
                    }
                }
                EngineEvent::StatsUpdated { name, text } => {
                    let handle = self.handles.tunnels.iter().find(|h| h.name == name);
                    match (handle.and_then(|h| h.stats.as_ref()), text) {
                        (Some(stats), Some(text)) => stats.set_text(format_stats(&text)),
                        (None, None) => {}
                        // Visibility changed; muda items cannot be hidden.
                        _ => rebuild = true,
                    }
                }
                EngineEvent::ToggleStarted { name } => self.set_switch_enabled(&name, false),
                EngineEvent::ToggleFinished { name, .. } => self.set_switch_enabled(&name, true),
                EngineEvent::Notify {
                    severity,
                    title,
                    body,
                } => match severity {
                    Severity::Info => self.notifier.info(&title, &body),
                    Severity::Error => self.notifier.error(&title, &body),
                },
            }
        }

        let snapshot = self.app_state.engine.snapshot();
        if rebuild {
            self.rebuild_menu();
        } else {
            self.handles
                .last_checked
                .set_text(format_last_poll(&snapshot.last_poll));
        }
        self.update_icon(snapshot.any_active);
    }

    fn set_switch_enabled(&self, name: &str, enabled: bool) {
        if let Some(handle) = self.handles.tunnels.iter().find(|h| h.name == name) {
            handle.item.set_enabled(enabled);
        }
    }

    fn rebuild_menu(&mut self) {
        let (menu, handles) = build_menu(&self.app_state.engine.snapshot());
        self.id_lookup = build_id_lookup(&handles);
        self.handles = handles;
        self.tray_icon.set_menu(Some(Box::new(menu)));
    }

    fn update_icon(&mut self, any_active: bool) {
        let icon = if any_active {
            self.active_icon.clone()
        } else {
            self.idle_icon.clone()
        };
        if let Err(e) = self.tray_icon.set_icon(Some(icon)) {
            warn!("failed to update tray icon: {e}");
        }
    }
}

fn open_config(paths: &dyn AppPaths) {
    let config_path = paths.config_path();
    let parent = config_path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or(config_path);

    info!("opening config folder at {:?}", parent);
    let result = Command::new("xdg-open").arg(&parent).spawn();
    if let Err(e) = result {
        warn!("xdg-open failed: {e}");
    }
}

fn build_icons() -> (Icon, Icon) {
    // Simple 16x16 solid dots; avoid extra assets on Linux
    let active = solid_icon([0x2e, 0xb8, 0x72, 0xff]); // green
    let idle = solid_icon([0x77, 0x77, 0x77, 0xff]); // gray
    (active, idle)
}

fn solid_icon(color: [u8; 4]) -> Icon {
    let (width, height) = (16, 16);
    let mut data = Vec::with_capacity(width * height * 4);
    for _ in 0..(width * height) {
        data.extend_from_slice(&color);
    }
    Icon::from_rgba(data, width as u32, height as u32).expect("failed to build icon")
}
