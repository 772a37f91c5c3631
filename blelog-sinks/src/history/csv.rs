//! Append-only CSV observation file.
//!
//! Every `save` is flushed and synced before it returns, so after a crash
//! the file holds every acknowledged row plus at most one partial line.
//! Opening the file again drops that partial line and keeps appending; the
//! header is only ever written to an empty file.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use blelog_domain::observation::Observation;

use super::{ObservationSink, SinkError};

const TAIL_CHUNK: u64 = 4096;

pub struct CsvObservationSink {
    path: PathBuf,
    file: File,
}

impl CsvObservationSink {
    pub async fn open<P>(path_arg: P) -> Result<CsvObservationSink, SinkError>
    where
        P: AsRef<Path>,
    {
        let path = path_arg.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;
        let len = file.metadata().await?.len();
        if len == 0 {
            write_header(&mut file).await?;
        } else {
            repair_tail(&mut file, len, &path).await?;
        }
        file.seek(SeekFrom::End(0)).await?;
        debug!("opened {} for appending", path.display());
        Ok(CsvObservationSink { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `Time,Value` followed by one `epoch_millis,value` record per observation.
pub fn encode(header: bool, observations: &[Observation]) -> Result<Vec<u8>, ::csv::Error> {
    let mut writer = ::csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(vec![]);
    if header {
        writer.write_record(["Time", "Value"])?;
    }
    for observation in observations {
        writer.serialize((observation.date_time.timestamp_millis(), observation.value))?;
    }
    writer.into_inner().map_err(|e| e.into_error().into())
}

async fn write_header(file: &mut File) -> Result<(), SinkError> {
    file.seek(SeekFrom::Start(0)).await?;
    file.write_all(&encode(true, &[])?).await?;
    file.flush().await?;
    file.sync_data().await?;
    Ok(())
}

/// Truncates everything after the last newline.
async fn repair_tail(file: &mut File, len: u64, path: &Path) -> Result<(), SinkError> {
    let mut end = len;
    let mut buf = vec![0u8; TAIL_CHUNK as usize];
    while end > 0 {
        let start = end.saturating_sub(TAIL_CHUNK);
        let n = (end - start) as usize;
        file.seek(SeekFrom::Start(start)).await?;
        file.read_exact(&mut buf[..n]).await?;
        if let Some(pos) = buf[..n].iter().rposition(|&b| b == b'\n') {
            let keep = start + pos as u64 + 1;
            if keep < len {
                warn!(
                    "dropping {} bytes of partial row at end of {}",
                    len - keep,
                    path.display()
                );
                file.set_len(keep).await?;
                file.sync_data().await?;
            }
            return Ok(());
        }
        end = start;
    }
    warn!("{} has no complete line, rewriting header", path.display());
    file.set_len(0).await?;
    write_header(file).await
}

#[async_trait]
impl ObservationSink for CsvObservationSink {
    async fn save(&mut self, observations: &[Observation]) -> Result<(), SinkError> {
        if observations.is_empty() {
            return Ok(());
        }
        let rows = encode(false, observations)?;
        self.file.write_all(&rows).await?;
        self.file.flush().await?;
        self.file.sync_data().await?;
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<(), SinkError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use chrono::{TimeZone, Utc};

    use blelog_domain::{device::DeviceId, observation::Observation};

    use crate::{history::ObservationSink, scratch::ScratchDir};

    use super::{CsvObservationSink, encode};

    fn observation(millis: i64, value: i32) -> Observation {
        Observation::new(
            Utc.timestamp_millis_opt(millis).unwrap(),
            DeviceId::new("00:00:00:00:00:01"),
            value,
        )
    }

    #[test]
    fn encodes_epoch_millis_rows() {
        let rows = encode(false, &[observation(1_700_000_000_123, -7)]).unwrap();
        assert_eq!(rows, b"1700000000123,-7\n");
        assert_eq!(encode(true, &[]).unwrap(), b"Time,Value\n");
    }

    #[tokio::test]
    async fn new_file_gets_header_and_rows() {
        let dir = ScratchDir::new();
        let path = dir.join("log.csv");
        let mut sink = CsvObservationSink::open(&path).await.unwrap();
        sink.save(&[observation(1000, 1), observation(2000, -2)])
            .await
            .unwrap();
        Box::new(sink).close().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "Time,Value\n1000,1\n2000,-2\n");
    }

    #[tokio::test]
    async fn reopening_appends_without_second_header() {
        let dir = ScratchDir::new();
        let path = dir.join("log.csv");
        {
            let mut sink = CsvObservationSink::open(&path).await.unwrap();
            sink.save(&[observation(1000, 1)]).await.unwrap();
        }
        let mut sink = CsvObservationSink::open(&path).await.unwrap();
        sink.save(&[observation(2000, 2)]).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "Time,Value\n1000,1\n2000,2\n");
    }

    #[tokio::test]
    async fn partial_row_is_dropped_on_open() {
        let dir = ScratchDir::new();
        let path = dir.join("log.csv");
        std::fs::write(&path, "Time,Value\n1000,1\n20").unwrap();

        let mut sink = CsvObservationSink::open(&path).await.unwrap();
        sink.save(&[observation(3000, 3)]).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "Time,Value\n1000,1\n3000,3\n");
    }

    #[tokio::test]
    async fn torn_header_is_rewritten() {
        let dir = ScratchDir::new();
        let path = dir.join("log.csv");
        std::fs::write(&path, "Time,Va").unwrap();

        CsvObservationSink::open(&path).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "Time,Value\n");
    }

    #[tokio::test]
    async fn empty_batch_writes_nothing() {
        let dir = ScratchDir::new();
        let path = dir.join("log.csv");
        let mut sink = CsvObservationSink::open(&path).await.unwrap();
        sink.save(&[]).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "Time,Value\n");
    }
}
