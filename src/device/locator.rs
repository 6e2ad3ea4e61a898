//! HID device discovery via sysfs.
//!
//! Walks `/sys/class/hidraw/*/device/uevent` and keeps the nodes whose
//! vendor/product/interface match a known sensor model.

use super::models::{DeviceModel, UsbId};
use log::{debug, warn};
use std::fs;
use std::path::PathBuf;

/// Reference to one physical sensor, valid for the duration of an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorHandle {
    /// Device node (e.g. `/dev/hidraw3`).
    pub path: PathBuf,
    /// USB physical path, stable per port.
    pub phys: String,
    pub name: String,
    pub model: DeviceModel,
}

impl SensorHandle {
    /// Where the device is plugged in; falls back to the node path when the
    /// kernel reports no physical path.
    pub fn port(&self) -> String {
        if self.phys.is_empty() {
            self.path.display().to_string()
        } else {
            self.phys.clone()
        }
    }
}

/// Fields of interest from a hidraw `uevent` file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct HidUevent {
    id: Option<UsbId>,
    name: String,
    phys: String,
}

impl HidUevent {
    fn parse(content: &str) -> Self {
        let mut event = Self::default();
        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "HID_ID" => event.id = parse_hid_id(value),
                "HID_NAME" => event.name = value.to_string(),
                "HID_PHYS" => event.phys = value.to_string(),
                _ => {}
            }
        }
        event
    }

    /// USB interface number from the `.../inputN` suffix of `HID_PHYS`.
    fn interface(&self) -> Option<u8> {
        self.phys
            .rsplit_once("/input")
            .and_then(|(_, n)| n.parse().ok())
    }
}

/// `HID_ID=0003:0000413D:00002107` -> 413d:2107
fn parse_hid_id(value: &str) -> Option<UsbId> {
    let mut parts = value.split(':');
    let _bus = parts.next()?;
    let vendor = u32::from_str_radix(parts.next()?, 16).ok()?;
    let product = u32::from_str_radix(parts.next()?, 16).ok()?;
    Some(UsbId {
        vendor: u16::try_from(vendor).ok()?,
        product: u16::try_from(product).ok()?,
    })
}

pub struct DeviceLocator {
    sysfs_root: PathBuf,
    dev_root: PathBuf,
    models: Vec<DeviceModel>,
}

impl DeviceLocator {
    pub fn new(sysfs_root: impl Into<PathBuf>, models: Vec<DeviceModel>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            dev_root: PathBuf::from("/dev"),
            models,
        }
    }

    /// Override where device nodes live (defaults to `/dev`).
    pub fn with_dev_root(mut self, dev_root: impl Into<PathBuf>) -> Self {
        self.dev_root = dev_root.into();
        self
    }

    /// Enumerate attached sensors.
    ///
    /// Ordered by USB physical path, then node name, so the order is the same
    /// on every call for unchanged hardware. No matching hardware (or no
    /// hidraw class at all) yields an empty list.
    pub fn discover(&self) -> Vec<SensorHandle> {
        let entries = match fs::read_dir(&self.sysfs_root) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(
                    "Cannot read {}: {} (no HID devices?)",
                    self.sysfs_root.display(),
                    e
                );
                return Vec::new();
            }
        };

        let mut found: Vec<(String, u32, SensorHandle)> = Vec::new();
        for entry in entries.flatten() {
            let node = entry.file_name().to_string_lossy().into_owned();
            let uevent_path = entry.path().join("device").join("uevent");
            let content = match fs::read_to_string(&uevent_path) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Skipping {}: {}", uevent_path.display(), e);
                    continue;
                }
            };

            let event = HidUevent::parse(&content);
            let Some(model) = self.match_model(&event) else {
                continue;
            };

            debug!(
                "Found {} ({}) at {} [{}]",
                model.name, model.id, node, event.phys
            );
            found.push((
                event.phys.clone(),
                node_number(&node),
                SensorHandle {
                    path: self.dev_root.join(&node),
                    phys: event.phys,
                    name: event.name,
                    model,
                },
            ));
        }

        found.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));
        found.into_iter().map(|(_, _, handle)| handle).collect()
    }

    fn match_model(&self, event: &HidUevent) -> Option<DeviceModel> {
        let id = event.id?;
        let interface = event.interface();
        self.models
            .iter()
            .find(|m| m.id == id && interface.is_none_or(|i| i == m.interface))
            .copied()
    }
}

fn node_number(node: &str) -> u32 {
    node.trim_start_matches(|c: char| !c.is_ascii_digit())
        .parse()
        .unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::FakeSysfs;
    use crate::device::models::KNOWN_MODELS;
    use std::path::Path;

    fn handle_paths(handles: &[SensorHandle]) -> Vec<&Path> {
        handles.iter().map(|h| h.path.as_path()).collect()
    }

    #[test]
    fn test_parse_hid_id() {
        assert_eq!(
            parse_hid_id("0003:0000413D:00002107"),
            Some(UsbId {
                vendor: 0x413d,
                product: 0x2107
            })
        );
        assert_eq!(parse_hid_id("0003:0001413D:00002107"), None);
        assert_eq!(parse_hid_id("garbage"), None);
    }

    #[test]
    fn test_missing_sysfs_is_empty_not_error() {
        let locator = DeviceLocator::new("/nonexistent/hidraw", KNOWN_MODELS.to_vec());
        assert!(locator.discover().is_empty());
    }

    #[test]
    fn test_discovers_matching_interface_only() {
        let sysfs = FakeSysfs::new("iface");
        // Keyboard interface of the same device must be ignored
        sysfs.add("hidraw0", "0003:0000413D:00002107", "usb-0000:00:14.0-1/input0");
        sysfs.add("hidraw1", "0003:0000413D:00002107", "usb-0000:00:14.0-1/input1");
        // Unrelated device
        sysfs.add("hidraw2", "0003:0000046D:0000C52B", "usb-0000:00:14.0-3/input1");

        let handles = sysfs.locator().with_dev_root("/dev").discover();
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].path, PathBuf::from("/dev/hidraw1"));
        assert_eq!(handles[0].model.name, "TEMPerHUM");
    }

    #[test]
    fn test_order_is_by_physical_port() {
        let sysfs = FakeSysfs::new("order");
        sysfs.add("hidraw7", "0003:0000413D:00002107", "usb-0000:00:14.0-1/input1");
        sysfs.add("hidraw3", "0003:0000413D:00002107", "usb-0000:00:14.0-2/input1");

        let locator = sysfs.locator();
        let first = locator.discover();
        assert_eq!(
            handle_paths(&first),
            vec![Path::new("/dev/hidraw7"), Path::new("/dev/hidraw3")]
        );
        assert_eq!(first, locator.discover());
    }

    #[test]
    fn test_port_falls_back_to_node_path() {
        let sysfs = FakeSysfs::new("port");
        sysfs.add("hidraw4", "0003:0000413D:00002107", "");
        sysfs.add("hidraw5", "0003:0000413D:00002107", "usb-0000:00:14.0-2/input1");

        let handles = sysfs.locator().discover();
        let ports: Vec<String> = handles.iter().map(SensorHandle::port).collect();
        assert_eq!(ports, vec!["/dev/hidraw4", "usb-0000:00:14.0-2/input1"]);
    }
}
