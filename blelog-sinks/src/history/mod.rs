pub mod csv;
pub mod jsonl;
pub mod sqllite;

use std::{
    error::Error,
    ffi::OsStr,
    path::{Path, PathBuf},
};

use async_trait::async_trait;

use blelog_domain::observation::Observation;

use crate::history::{
    csv::CsvObservationSink, jsonl::JsonLinesObservationSink, sqllite::SqliteObservationSink,
};

pub type SinkError = Box<dyn Error + Send + Sync>;

#[async_trait]
pub trait ObservationSink: Send {
    async fn save(&mut self, observations: &[Observation]) -> Result<(), SinkError>;
    async fn close(mut self: Box<Self>) -> Result<(), SinkError>;
}

/// Writes every batch to each inner sink. All sinks are attempted; the first
/// error is returned.
pub struct FanOutSink(Vec<Box<dyn ObservationSink>>);

impl FanOutSink {
    pub fn new(sinks: Vec<Box<dyn ObservationSink>>) -> Self {
        FanOutSink(sinks)
    }
}

#[async_trait]
impl ObservationSink for FanOutSink {
    async fn save(&mut self, observations: &[Observation]) -> Result<(), SinkError> {
        let mut first_error = None;
        for sink in &mut self.0 {
            if let Err(e) = sink.save(observations).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn close(mut self: Box<Self>) -> Result<(), SinkError> {
        let mut first_error = None;
        for sink in self.0.drain(..) {
            if let Err(e) = sink.close().await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[derive(PartialEq, Debug)]
pub enum SinkFormat {
    Csv(PathBuf),
    JsonLines(PathBuf),
    Sqlite(PathBuf),
}

impl SinkFormat {
    pub fn create_from_file<P>(path_arg: P) -> Result<SinkFormat, SinkError>
    where
        P: AsRef<Path>,
    {
        let path = path_arg.as_ref();
        match path.extension().and_then(OsStr::to_str) {
            Some("csv") => Ok(SinkFormat::Csv(path.to_path_buf())),
            Some("jsonl") => Ok(SinkFormat::JsonLines(path.to_path_buf())),
            Some("sqlite") => Ok(SinkFormat::Sqlite(path.to_path_buf())),
            _ => Err(format!("unknown type: {}", path.display()).into()),
        }
    }

    pub async fn to_sink(&self) -> Result<Box<dyn ObservationSink>, SinkError> {
        use SinkFormat::*;
        match self {
            Csv(path_buf) => Ok(Box::new(CsvObservationSink::open(path_buf).await?)),
            JsonLines(path_buf) => Ok(Box::new(JsonLinesObservationSink::append_to_file(
                path_buf,
            )?)),
            Sqlite(path_buf) => SqliteObservationSink::create_from_file(path_buf).await,
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    use blelog_domain::{device::DeviceId, observation::Observation};

    use super::{FanOutSink, ObservationSink, SinkError, SinkFormat};

    #[test]
    fn format_matching() {
        assert_eq!(
            SinkFormat::create_from_file("foop.sqlite").unwrap(),
            SinkFormat::Sqlite("foop.sqlite".into())
        );
        assert_eq!(
            SinkFormat::create_from_file("foop.jsonl").unwrap(),
            SinkFormat::JsonLines("foop.jsonl".into())
        );
        assert_eq!(
            SinkFormat::create_from_file("foop.csv").unwrap(),
            SinkFormat::Csv("foop.csv".into())
        );
    }

    #[test]
    fn format_not_matching() {
        for i in ["foop.json", "farp", "feep.txt"] {
            assert!(SinkFormat::create_from_file(i).is_err());
        }
    }

    struct Recording {
        saved: Arc<Mutex<usize>>,
        fail: bool,
    }

    #[async_trait]
    impl ObservationSink for Recording {
        async fn save(&mut self, observations: &[Observation]) -> Result<(), SinkError> {
            if self.fail {
                return Err("disk full".into());
            }
            *self.saved.lock().unwrap() += observations.len();
            Ok(())
        }
        async fn close(mut self: Box<Self>) -> Result<(), SinkError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn fan_out_reaches_healthy_sinks_despite_failure() {
        let saved = Arc::new(Mutex::new(0));
        let mut sink = FanOutSink::new(vec![
            Box::new(Recording {
                saved: saved.clone(),
                fail: true,
            }),
            Box::new(Recording {
                saved: saved.clone(),
                fail: false,
            }),
        ]);
        let observation = Observation::new(
            Utc.timestamp_opt(1, 0).unwrap(),
            DeviceId::new("00:00:00:00:00:01"),
            5,
        );
        let result = sink.save(&[observation]).await;
        assert_eq!(result.unwrap_err().to_string(), "disk full");
        assert_eq!(*saved.lock().unwrap(), 1);
    }
}
