//! Desktop notifications through the freedesktop notification service.

use log::{debug, warn};
use notify_rust::{Hint, Notification, Timeout};
use wg_manager_core::platform::Notifier;

const APP_NAME: &str = "WireGuard Manager";

#[derive(Default)]
pub struct DesktopNotifier;

impl DesktopNotifier {
    fn show(&self, title: &str, body: &str, icon: &str) {
        let result = Notification::new()
            .appname(APP_NAME)
            .summary(title)
            .body(body)
            .icon(icon)
            .hint(Hint::Transient(true))
            .timeout(Timeout::Milliseconds(5000))
            .show();

        match result {
            Ok(_) => debug!("notification shown: {title}"),
            Err(e) => warn!("failed to show notification: {e}"),
        }
    }
}

impl Notifier for DesktopNotifier {
    fn info(&self, title: &str, body: &str) {
        self.show(title, body, "network-vpn-symbolic");
    }

    fn error(&self, title: &str, body: &str) {
        self.show(title, body, "network-vpn-disconnected-symbolic");
    }
}
