//! Where each device's CSV files live.
//!
//! The data root holds one folder per device and a `catalog.json` document
//! recording the known devices, each device's folder and files, and which
//! file new samples go to.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, info};

use blelog_domain::{device::DeviceId, known::KnownDevices};

use crate::{history::csv::encode, prefs::PreferenceStore};

pub const CATALOG_FILE: &str = "catalog.json";

const FILE_NAME_FORMAT: &str = "%d %B %Y, %H:%M:%S";

#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed catalog: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("no folder for device {0}")]
    NoDeviceFolder(DeviceId),
    #[error("device {device} has no file named {name:?}")]
    UnknownFile { device: DeviceId, name: String },
}

#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq)]
pub struct DeviceEntry {
    pub folder: String,
    #[serde(default)]
    pub files: BTreeSet<String>,
    #[serde(default)]
    pub selected: Option<String>,
}

#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq)]
pub struct CatalogDocument {
    #[serde(default)]
    pub known: KnownDevices,
    #[serde(default)]
    pub devices: BTreeMap<DeviceId, DeviceEntry>,
}

pub struct Catalog {
    root: PathBuf,
    store: PreferenceStore<CatalogDocument>,
    document: CatalogDocument,
}

impl Catalog {
    pub async fn open<P: AsRef<Path>>(root_arg: P) -> Result<Catalog, CatalogError> {
        let root = root_arg.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        let store = PreferenceStore::new(root.join(CATALOG_FILE));
        let document: CatalogDocument = store.load().await?;
        debug!(
            "catalog at {} has {} device folders",
            root.display(),
            document.devices.len()
        );
        Ok(Catalog {
            root,
            store,
            document,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn persist(&self) -> Result<(), CatalogError> {
        self.store.save(&self.document).await
    }

    pub fn known_devices(&self) -> &KnownDevices {
        &self.document.known
    }

    /// Returns true if the device was not known before.
    pub async fn remember_device(&mut self, device: &DeviceId) -> Result<bool, CatalogError> {
        let added = self.document.known.insert(device.clone());
        if added {
            self.persist().await?;
        }
        Ok(added)
    }

    pub async fn forget_device(&mut self, device: &DeviceId) -> Result<bool, CatalogError> {
        let removed = self.document.known.remove(device);
        if removed {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Creating an existing folder is a no-op.
    pub async fn create_device_folder(&mut self, device: &DeviceId) -> Result<PathBuf, CatalogError> {
        if let Some(path) = self.device_folder(device) {
            fs::create_dir_all(&path).await?;
            return Ok(path);
        }
        let folder = device.folder_name();
        let path = self.root.join(&folder);
        fs::create_dir_all(&path).await?;
        self.document.devices.insert(
            device.clone(),
            DeviceEntry {
                folder,
                ..DeviceEntry::default()
            },
        );
        self.persist().await?;
        info!("created folder {} for {device}", path.display());
        Ok(path)
    }

    pub fn device_folder(&self, device: &DeviceId) -> Option<PathBuf> {
        self.document
            .devices
            .get(device)
            .map(|entry| self.root.join(&entry.folder))
    }

    /// Removes the folder with every file in it and the device's entries.
    pub async fn delete_device_folder(&mut self, device: &DeviceId) -> Result<(), CatalogError> {
        let Some(path) = self.device_folder(device) else {
            return Ok(());
        };
        self.document.devices.remove(device);
        self.persist().await?;
        match fs::remove_dir_all(&path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        info!("deleted folder {}", path.display());
        Ok(())
    }

    /// Creates an empty CSV file, named after `now`, in the device folder.
    pub async fn create_csv_file<Tz>(
        &mut self,
        device: &DeviceId,
        now: &DateTime<Tz>,
    ) -> Result<String, CatalogError>
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        let folder = self
            .device_folder(device)
            .ok_or_else(|| CatalogError::NoDeviceFolder(device.clone()))?;
        let stem = now.format(FILE_NAME_FORMAT).to_string();
        let mut suffix = 1;
        let (name, mut file) = loop {
            let name = if suffix == 1 {
                format!("{stem}.csv")
            } else {
                format!("{stem} ({suffix}).csv")
            };
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(folder.join(&name))
                .await
            {
                Ok(file) => break (name, file),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => suffix += 1,
                Err(e) => return Err(e.into()),
            }
        };
        file.write_all(&encode(true, &[])?).await?;
        file.sync_all().await?;

        if let Some(entry) = self.document.devices.get_mut(device) {
            entry.files.insert(name.clone());
        }
        self.persist().await?;
        info!("created CSV file {name:?} for {device}");
        Ok(name)
    }

    pub fn files(&self, device: &DeviceId) -> Vec<String> {
        self.document
            .devices
            .get(device)
            .map(|entry| entry.files.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn file_path(&self, device: &DeviceId, name: &str) -> Option<PathBuf> {
        let entry = self.document.devices.get(device)?;
        entry
            .files
            .contains(name)
            .then(|| self.root.join(&entry.folder).join(name))
    }

    pub async fn delete_csv_file(&mut self, device: &DeviceId, name: &str) -> Result<(), CatalogError> {
        let path = self.require_file(device, name)?;
        if let Some(entry) = self.document.devices.get_mut(device) {
            entry.files.remove(name);
            if entry.selected.as_deref() == Some(name) {
                entry.selected = None;
            }
        }
        self.persist().await?;
        match fs::remove_file(&path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        info!("deleted file {}", path.display());
        Ok(())
    }

    /// `None` clears the selection.
    pub async fn select_file(
        &mut self,
        device: &DeviceId,
        name: Option<&str>,
    ) -> Result<(), CatalogError> {
        if let Some(name) = name {
            self.require_file(device, name)?;
        }
        let Some(entry) = self.document.devices.get_mut(device) else {
            return match name {
                Some(_) => Err(CatalogError::NoDeviceFolder(device.clone())),
                None => Ok(()),
            };
        };
        entry.selected = name.map(str::to_string);
        self.persist().await
    }

    pub fn selected_file(&self, device: &DeviceId) -> Option<&str> {
        self.document.devices.get(device)?.selected.as_deref()
    }

    pub fn selected_path(&self, device: &DeviceId) -> Option<PathBuf> {
        let name = self.selected_file(device)?;
        self.file_path(device, name)
    }

    /// Reads `(epoch millis, value)` points, skipping the header and any
    /// line that does not parse.
    pub async fn read_series(
        &self,
        device: &DeviceId,
        name: &str,
    ) -> Result<Vec<(i64, f64)>, CatalogError> {
        let path = self.require_file(device, name)?;
        let contents = fs::read_to_string(&path).await?;
        Ok(parse_series(&contents))
    }

    fn require_file(&self, device: &DeviceId, name: &str) -> Result<PathBuf, CatalogError> {
        if !self.document.devices.contains_key(device) {
            return Err(CatalogError::NoDeviceFolder(device.clone()));
        }
        self.file_path(device, name)
            .ok_or_else(|| CatalogError::UnknownFile {
                device: device.clone(),
                name: name.to_string(),
            })
    }
}

fn parse_series(contents: &str) -> Vec<(i64, f64)> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(contents.as_bytes());
    reader
        .records()
        .filter_map(Result::ok)
        .filter(|record| record.len() == 2)
        .filter_map(|record| Some((record[0].parse().ok()?, record[1].parse().ok()?)))
        .collect()
}

#[cfg(test)]
mod test {
    use chrono::{FixedOffset, TimeZone};

    use blelog_domain::device::DeviceId;

    use crate::scratch::ScratchDir;

    use super::{Catalog, CatalogError, parse_series};

    fn device() -> DeviceId {
        DeviceId::new("aa:bb:cc:dd:ee:ff")
    }

    fn noon() -> chrono::DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 3, 5, 12, 0, 7)
            .unwrap()
    }

    #[tokio::test]
    async fn csv_file_needs_device_folder() {
        let dir = ScratchDir::new();
        let mut catalog = Catalog::open(dir.path()).await.unwrap();
        let result = catalog.create_csv_file(&device(), &noon()).await;
        assert!(matches!(result, Err(CatalogError::NoDeviceFolder(_))));
    }

    #[tokio::test]
    async fn creates_timestamp_named_files() {
        let dir = ScratchDir::new();
        let mut catalog = Catalog::open(dir.path()).await.unwrap();
        let folder = catalog.create_device_folder(&device()).await.unwrap();
        assert_eq!(folder, dir.join("AA-BB-CC-DD-EE-FF"));

        let first = catalog.create_csv_file(&device(), &noon()).await.unwrap();
        let second = catalog.create_csv_file(&device(), &noon()).await.unwrap();
        assert_eq!(first, "05 March 2024, 12:00:07.csv");
        assert_eq!(second, "05 March 2024, 12:00:07 (2).csv");
        assert_eq!(catalog.files(&device()), vec![second, first.clone()]);

        let contents = std::fs::read_to_string(folder.join(&first)).unwrap();
        assert_eq!(contents, "Time,Value\n");
    }

    #[tokio::test]
    async fn selection_survives_reopen() {
        let dir = ScratchDir::new();
        let name = {
            let mut catalog = Catalog::open(dir.path()).await.unwrap();
            catalog.create_device_folder(&device()).await.unwrap();
            let name = catalog.create_csv_file(&device(), &noon()).await.unwrap();
            catalog.select_file(&device(), Some(&name)).await.unwrap();
            name
        };
        let catalog = Catalog::open(dir.path()).await.unwrap();
        assert_eq!(catalog.selected_file(&device()), Some(name.as_str()));
        assert_eq!(
            catalog.selected_path(&device()),
            Some(dir.join("AA-BB-CC-DD-EE-FF").join(&name))
        );
    }

    #[tokio::test]
    async fn selecting_unknown_file_fails() {
        let dir = ScratchDir::new();
        let mut catalog = Catalog::open(dir.path()).await.unwrap();
        catalog.create_device_folder(&device()).await.unwrap();
        let result = catalog.select_file(&device(), Some("nope.csv")).await;
        assert!(matches!(result, Err(CatalogError::UnknownFile { .. })));
    }

    #[tokio::test]
    async fn deleting_selected_file_clears_selection() {
        let dir = ScratchDir::new();
        let mut catalog = Catalog::open(dir.path()).await.unwrap();
        let folder = catalog.create_device_folder(&device()).await.unwrap();
        let name = catalog.create_csv_file(&device(), &noon()).await.unwrap();
        catalog.select_file(&device(), Some(&name)).await.unwrap();

        catalog.delete_csv_file(&device(), &name).await.unwrap();

        assert_eq!(catalog.selected_file(&device()), None);
        assert!(catalog.files(&device()).is_empty());
        assert!(!folder.join(&name).exists());
    }

    #[tokio::test]
    async fn deleting_folder_removes_everything() {
        let dir = ScratchDir::new();
        let mut catalog = Catalog::open(dir.path()).await.unwrap();
        let folder = catalog.create_device_folder(&device()).await.unwrap();
        let name = catalog.create_csv_file(&device(), &noon()).await.unwrap();
        catalog.select_file(&device(), Some(&name)).await.unwrap();

        catalog.delete_device_folder(&device()).await.unwrap();

        assert!(!folder.exists());
        assert_eq!(catalog.device_folder(&device()), None);
        assert_eq!(catalog.selected_file(&device()), None);
        let reopened = Catalog::open(dir.path()).await.unwrap();
        assert_eq!(reopened.device_folder(&device()), None);
    }

    #[tokio::test]
    async fn known_devices_persist() {
        let dir = ScratchDir::new();
        {
            let mut catalog = Catalog::open(dir.path()).await.unwrap();
            assert!(catalog.remember_device(&device()).await.unwrap());
            assert!(!catalog.remember_device(&device()).await.unwrap());
        }
        let mut catalog = Catalog::open(dir.path()).await.unwrap();
        assert!(catalog.known_devices().contains(&device()));
        assert!(catalog.forget_device(&device()).await.unwrap());
        assert!(catalog.known_devices().is_empty());
    }

    #[tokio::test]
    async fn reads_series_back() {
        let dir = ScratchDir::new();
        let mut catalog = Catalog::open(dir.path()).await.unwrap();
        let folder = catalog.create_device_folder(&device()).await.unwrap();
        let name = catalog.create_csv_file(&device(), &noon()).await.unwrap();
        std::fs::write(folder.join(&name), "Time,Value\n1000,5\n2000,-3\n").unwrap();

        let series = catalog.read_series(&device(), &name).await.unwrap();
        assert_eq!(series, vec![(1000, 5.0), (2000, -3.0)]);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let series = parse_series("Time,Value\n1,2\nbad\n3,x\n4,5,6\n\n7,8.5\n");
        assert_eq!(series, vec![(1, 2.0), (7, 8.5)]);
    }
}
