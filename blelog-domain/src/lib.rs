pub mod chrono_extra;
pub mod device;
pub mod device_state;
pub mod discover;
pub mod gatt;
pub mod known;
pub mod observation;
pub mod retry;
pub mod session;
pub mod snapshot;
pub mod state;
