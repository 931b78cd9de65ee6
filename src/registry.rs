//! Persisted device records, unique on `(ip, port)`.
//!
//! Scans never write here. Records are created or updated only by an explicit confirm/add
//! action. The file-backed variant rewrites its JSON document after every mutation, through a
//! temporary file and a rename so a crash never leaves a half-written registry.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Result, ScanError};
use crate::types::DeviceDescriptor;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedDevice {
    pub id: u64,
    pub ip: Ipv4Addr,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub has_scanner: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scanner_type: Option<String>,
    pub is_active: bool,
}

/// Body of an add/confirm action.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NewDevice {
    pub ip: Ipv4Addr,
    pub port: u16,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_true")]
    pub has_scanner: bool,
    #[serde(default)]
    pub scanner_type: Option<String>,
}

fn default_true() -> bool {
    true
}

impl NewDevice {
    /// Turn a scan descriptor into a record to persist, with an optional display name.
    pub fn confirm(descriptor: &DeviceDescriptor, name: Option<String>) -> Self {
        Self {
            ip: descriptor.ip,
            port: descriptor.port,
            name,
            vendor: descriptor.vendor.clone(),
            model: descriptor.model.clone(),
            has_scanner: descriptor.has_scanner,
            scanner_type: descriptor.scanner_type.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct Document {
    next_id: u64,
    devices: Vec<PersistedDevice>,
}

pub struct DeviceRegistry {
    path: Option<PathBuf>,
    doc: Mutex<Document>,
}

impl DeviceRegistry {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            doc: Mutex::new(Document {
                next_id: 1,
                devices: Vec::new(),
            }),
        }
    }

    /// Open a JSON-file registry, starting empty when the file does not exist yet.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let doc = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str::<Document>(&raw).map_err(|e| {
                ScanError::Registry(format!("{} is not a device registry: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Document {
                next_id: 1,
                devices: Vec::new(),
            },
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), devices = doc.devices.len(), "device registry opened");
        Ok(Self {
            path: Some(path),
            doc: Mutex::new(doc),
        })
    }

    /// Create the record for `(ip, port)` or update the existing one. Provided optional fields
    /// replace stored ones; absent ones are kept. The record becomes active.
    pub async fn upsert(&self, new: NewDevice) -> Result<PersistedDevice> {
        let mut doc = self.doc.lock().await;
        let saved = match doc
            .devices
            .iter_mut()
            .find(|d| d.ip == new.ip && d.port == new.port)
        {
            Some(d) => {
                if new.name.is_some() {
                    d.name = new.name;
                }
                if new.vendor.is_some() {
                    d.vendor = new.vendor;
                }
                if new.model.is_some() {
                    d.model = new.model;
                }
                if new.scanner_type.is_some() {
                    d.scanner_type = new.scanner_type;
                }
                d.has_scanner = new.has_scanner;
                d.is_active = true;
                d.clone()
            }
            None => {
                let device = PersistedDevice {
                    id: doc.next_id.max(1),
                    ip: new.ip,
                    port: new.port,
                    name: new.name,
                    vendor: new.vendor,
                    model: new.model,
                    has_scanner: new.has_scanner,
                    scanner_type: new.scanner_type,
                    is_active: true,
                };
                doc.next_id = device.id + 1;
                doc.devices.push(device.clone());
                device
            }
        };
        self.persist(&doc).await?;
        tracing::info!(ip = %saved.ip, port = saved.port, id = saved.id, "device saved");
        Ok(saved)
    }

    /// Active scanner-capable devices, by name (unnamed last) then numeric IP.
    pub async fn list_scanners(&self) -> Vec<PersistedDevice> {
        let doc = self.doc.lock().await;
        let mut out: Vec<PersistedDevice> = doc
            .devices
            .iter()
            .filter(|d| d.is_active && d.has_scanner)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            let name_a = (a.name.is_none(), a.name.as_deref());
            let name_b = (b.name.is_none(), b.name.as_deref());
            name_a
                .cmp(&name_b)
                .then_with(|| u32::from(a.ip).cmp(&u32::from(b.ip)))
                .then_with(|| a.port.cmp(&b.port))
        });
        out
    }

    pub async fn get(&self, ip: Ipv4Addr, port: u16) -> Option<PersistedDevice> {
        let doc = self.doc.lock().await;
        doc.devices
            .iter()
            .find(|d| d.ip == ip && d.port == port)
            .cloned()
    }

    /// Mark a device inactive. Returns `false` when no such device exists.
    pub async fn deactivate(&self, ip: Ipv4Addr, port: u16) -> Result<bool> {
        let mut doc = self.doc.lock().await;
        let Some(d) = doc.devices.iter_mut().find(|d| d.ip == ip && d.port == port) else {
            return Ok(false);
        };
        d.is_active = false;
        self.persist(&doc).await?;
        Ok(true)
    }

    async fn persist(&self, doc: &Document) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(doc)
            .map_err(|e| ScanError::Registry(format!("cannot encode registry: {e}")))?;
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(ip: [u8; 4], port: u16, name: Option<&str>) -> NewDevice {
        NewDevice {
            ip: Ipv4Addr::from(ip),
            port,
            name: name.map(str::to_string),
            vendor: Some("Canon".into()),
            model: None,
            has_scanner: true,
            scanner_type: Some("MFP".into()),
        }
    }

    #[tokio::test]
    async fn upsert_is_keyed_on_ip_and_port() {
        let reg = DeviceRegistry::in_memory();
        let a = reg.upsert(device([10, 0, 0, 5], 9100, None)).await.unwrap();
        let mut update = device([10, 0, 0, 5], 9100, Some("Front desk"));
        update.vendor = None;
        update.model = Some("MF445dw".into());
        let b = reg.upsert(update).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.name.as_deref(), Some("Front desk"));
        assert_eq!(b.vendor.as_deref(), Some("Canon"));
        assert_eq!(b.model.as_deref(), Some("MF445dw"));

        let c = reg.upsert(device([10, 0, 0, 5], 631, None)).await.unwrap();
        assert_ne!(c.id, a.id);
        assert_eq!(reg.list_scanners().await.len(), 2);
    }

    #[tokio::test]
    async fn list_sorts_by_name_then_numeric_ip() {
        let reg = DeviceRegistry::in_memory();
        reg.upsert(device([10, 0, 0, 20], 9100, None)).await.unwrap();
        reg.upsert(device([10, 0, 0, 3], 9100, None)).await.unwrap();
        reg.upsert(device([10, 0, 0, 9], 9100, Some("Archive"))).await.unwrap();
        let mut not_scanner = device([10, 0, 0, 1], 80, Some("AAA"));
        not_scanner.has_scanner = false;
        reg.upsert(not_scanner).await.unwrap();

        let ips: Vec<String> = reg
            .list_scanners()
            .await
            .iter()
            .map(|d| d.ip.to_string())
            .collect();
        assert_eq!(ips, vec!["10.0.0.9", "10.0.0.3", "10.0.0.20"]);
    }

    #[tokio::test]
    async fn deactivated_devices_are_hidden_until_upserted() {
        let reg = DeviceRegistry::in_memory();
        reg.upsert(device([10, 0, 0, 5], 9100, None)).await.unwrap();
        assert!(reg.deactivate(Ipv4Addr::new(10, 0, 0, 5), 9100).await.unwrap());
        assert!(!reg.deactivate(Ipv4Addr::new(10, 0, 0, 6), 9100).await.unwrap());
        assert!(reg.list_scanners().await.is_empty());
        reg.upsert(device([10, 0, 0, 5], 9100, None)).await.unwrap();
        assert_eq!(reg.list_scanners().await.len(), 1);
    }

    #[tokio::test]
    async fn file_registry_survives_reopen() {
        let path = std::env::temp_dir().join(format!("mfp-registry-{}.json", uuid::Uuid::new_v4()));
        {
            let reg = DeviceRegistry::open(&path).await.unwrap();
            reg.upsert(device([192, 168, 1, 11], 9100, Some("Office"))).await.unwrap();
        }
        let reg = DeviceRegistry::open(&path).await.unwrap();
        let d = reg.get(Ipv4Addr::new(192, 168, 1, 11), 9100).await.unwrap();
        assert_eq!(d.name.as_deref(), Some("Office"));
        let next = reg.upsert(device([192, 168, 1, 12], 9100, None)).await.unwrap();
        assert_eq!(next.id, 2);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn confirm_copies_descriptor_fields() {
        let mut d = DeviceDescriptor::online(Ipv4Addr::new(10, 0, 0, 8), 631);
        d.vendor = Some("HP".into());
        d.has_scanner = true;
        d.scanner_type = Some("IPP Scanner".into());
        let n = NewDevice::confirm(&d, Some("Lab".into()));
        assert_eq!(n.ip, d.ip);
        assert_eq!(n.vendor.as_deref(), Some("HP"));
        assert_eq!(n.scanner_type.as_deref(), Some("IPP Scanner"));
        assert_eq!(n.name.as_deref(), Some("Lab"));
    }
}
