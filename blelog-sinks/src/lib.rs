pub mod catalog;
pub mod history;
pub mod prefs;

#[cfg(any(test, feature = "test-util"))]
pub mod scratch;
