//! Small shared helpers used across the bridge.

use tokio::sync::watch;

/// A multi-waiter boolean event in the style of a set/clear/wait flag.
/// Cloning shares the underlying state.
#[derive(Clone)]
pub struct Event {
    tx: watch::Sender<bool>,
}

impl Event {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves as soon as the event is set; immediately if already set.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|set| *set).await;
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

/// Hex-dump bytes for debug logs, e.g. `55 01 ff aa`.
pub fn format_binary(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Map an RSSI reading (roughly -100..0 dBm) onto the 0..255 linkquality
/// scale Home Assistant expects.
pub fn rssi_to_linkquality(rssi: i16) -> u8 {
    let clamped = (i32::from(rssi) + 100).clamp(0, 100);
    (clamped * 255 / 100) as u8
}

/// Normalize a MAC address to upper-case colon-hex, rejecting anything that
/// is not six hex octets.
pub fn normalize_mac(mac: &str) -> Option<String> {
    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    if !parts
        .iter()
        .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
    {
        return None;
    }
    Some(mac.to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_set_wakes_waiter() {
        let event = Event::new();
        let waiter = event.clone();
        let task = tokio::spawn(async move { waiter.wait().await });
        event.set();
        task.await.unwrap();
        assert!(event.is_set());
        event.clear();
        assert!(!event.is_set());
    }

    #[tokio::test]
    async fn event_wait_returns_immediately_when_set() {
        let event = Event::new();
        event.set();
        event.wait().await;
    }

    #[test]
    fn format_binary_spaces_bytes() {
        assert_eq!(format_binary(&[0x55, 0x01, 0xff, 0xaa]), "55 01 ff aa");
        assert_eq!(format_binary(&[]), "");
    }

    #[test]
    fn linkquality_scale() {
        assert_eq!(rssi_to_linkquality(-100), 0);
        assert_eq!(rssi_to_linkquality(0), 255);
        assert_eq!(rssi_to_linkquality(-50), 127);
        assert_eq!(rssi_to_linkquality(-120), 0);
        assert_eq!(rssi_to_linkquality(20), 255);
    }

    #[test]
    fn mac_normalization() {
        assert_eq!(
            normalize_mac("aa:bb:cc:dd:ee:ff").as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );
        assert_eq!(normalize_mac("aa:bb:cc:dd:ee"), None);
        assert_eq!(normalize_mac("aabbccddeeff"), None);
        assert_eq!(normalize_mac("zz:bb:cc:dd:ee:ff"), None);
    }
}
