use serde::{Deserialize, Serialize};

/// Stable hardware identifier of a remote device: its BLE address,
/// normalised to upper case so `aa:bb` and `AA:BB` name the same device.
#[derive(Hash, Eq, PartialEq, Ord, PartialOrd, Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(address: impl AsRef<str>) -> Self {
        DeviceId(address.as_ref().trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name usable as a single path component; `:` is not portable.
    pub fn folder_name(&self) -> String {
        self.0.replace(':', "-")
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

impl std::str::FromStr for DeviceId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(DeviceId::new(s))
    }
}
