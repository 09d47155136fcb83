use std::collections::HashMap;

use log::debug;
use tray_icon::menu::{CheckMenuItem, Menu, MenuId, MenuItem, PredefinedMenuItem};
use wg_manager_core::engine::{Snapshot, TunnelView};
use wg_manager_core::scheduler::format_last_poll;

pub struct MenuHandles {
    pub tunnels: Vec<TunnelHandle>,
    pub last_checked: MenuItem,
    pub refresh_id: MenuId,
    pub rescan_id: MenuId,
    pub open_config_id: MenuId,
    pub quit_id: MenuId,
}

pub struct TunnelHandle {
    pub id: MenuId,
    pub name: String,
    pub item: CheckMenuItem,
    /// Present only while stats are visible.
    pub stats: Option<MenuItem>,
}

#[derive(Clone, Debug)]
pub enum MenuAction {
    ToggleTunnel(String),
    Refresh,
    Rescan,
    OpenConfig,
    Quit,
}

pub fn build_menu(snapshot: &Snapshot) -> (Menu, MenuHandles) {
    let menu = Menu::new();

    let mut tunnels = Vec::new();
    if !snapshot.ready {
        append(&menu, &MenuItem::new("Loading…", false, None));
    } else if snapshot.tunnels.is_empty() {
        append(&menu, &MenuItem::new("No WireGuard configs found", false, None));
    } else {
        append(&menu, &MenuItem::new("WireGuard", false, None));
        for tunnel in &snapshot.tunnels {
            tunnels.push(add_tunnel(&menu, tunnel));
        }
    }

    append(&menu, &PredefinedMenuItem::separator());

    let last_checked = MenuItem::new(format_last_poll(&snapshot.last_poll), false, None);
    append(&menu, &last_checked);

    let refresh = MenuItem::new("Refresh now", true, None);
    let rescan = MenuItem::new("Rescan configs", true, None);
    let open_config = MenuItem::new("Open settings", true, None);
    let quit = MenuItem::new("Quit", true, None);
    append(&menu, &refresh);
    append(&menu, &rescan);
    append(&menu, &PredefinedMenuItem::separator());
    append(&menu, &open_config);
    append(&menu, &quit);

    (
        menu,
        MenuHandles {
            tunnels,
            last_checked,
            refresh_id: refresh.id().clone(),
            rescan_id: rescan.id().clone(),
            open_config_id: open_config.id().clone(),
            quit_id: quit.id().clone(),
        },
    )
}

fn add_tunnel(menu: &Menu, tunnel: &TunnelView) -> TunnelHandle {
    let item = CheckMenuItem::new(&tunnel.name, !tunnel.busy, tunnel.active, None);
    append(menu, &item);

    let stats = tunnel.stats.as_deref().map(|text| {
        let stats = MenuItem::new(format_stats(text), false, None);
        append(menu, &stats);
        stats
    });

    TunnelHandle {
        id: item.id().clone(),
        name: tunnel.name.clone(),
        item,
        stats,
    }
}

/// Indent stats lines under their tunnel.
pub fn format_stats(text: &str) -> String {
    text.lines()
        .map(|line| format!("    {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn append(menu: &Menu, item: &dyn tray_icon::menu::IsMenuItem) {
    if let Err(e) = menu.append(item) {
        debug!("failed to append menu item: {e}");
    }
}

pub fn build_id_lookup(handles: &MenuHandles) -> HashMap<MenuId, MenuAction> {
    let mut map = HashMap::new();
    for tunnel in &handles.tunnels {
        map.insert(
            tunnel.id.clone(),
            MenuAction::ToggleTunnel(tunnel.name.clone()),
        );
    }
    map.insert(handles.refresh_id.clone(), MenuAction::Refresh);
    map.insert(handles.rescan_id.clone(), MenuAction::Rescan);
    map.insert(handles.open_config_id.clone(), MenuAction::OpenConfig);
    map.insert(handles.quit_id.clone(), MenuAction::Quit);
    map
}
