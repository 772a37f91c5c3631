pub mod local;
pub mod supervisor;

use async_trait::async_trait;

use blelog_domain::discover::DiscoveryEvent;

#[derive(thiserror::Error, Debug)]
pub enum ScanError {
    #[error("no Bluetooth adapters found")]
    NoAdapter,
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),
}

#[async_trait]
pub trait Scanner: Send {
    /// One scan round: every device heard during the scan window.
    async fn scan(&mut self) -> Result<Vec<DiscoveryEvent>, ScanError>;
}
