use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use sqlx::{Pool, Sqlite, sqlite::SqlitePoolOptions};

use blelog_domain::observation::Observation;

use super::{ObservationSink, SinkError};

pub struct SqliteObservationSink {
    pool: Arc<Pool<Sqlite>>,
}

impl SqliteObservationSink {
    pub async fn create_from_file<P>(path_arg: P) -> Result<Box<dyn ObservationSink>, SinkError>
    where
        P: AsRef<Path>,
    {
        let url = format!("sqlite://{}?mode=rwc", path_arg.as_ref().display());
        let pool = Arc::new(SqlitePoolOptions::new().connect(&url).await?);
        let sink = SqliteObservationSink::create_from_pool(pool.clone()).await?;
        Ok(Box::new(sink))
    }

    pub async fn create_from_pool(
        pool: Arc<Pool<Sqlite>>,
    ) -> Result<SqliteObservationSink, SinkError> {
        sqlx::migrate!("../migrations").run(&*pool).await?;
        Ok(SqliteObservationSink { pool })
    }
}

#[async_trait]
impl ObservationSink for SqliteObservationSink {
    async fn save(&mut self, observations: &[Observation]) -> Result<(), SinkError> {
        let mut tx = self.pool.begin().await?;

        for o in observations {
            sqlx::query(
                "
            INSERT INTO observations (date_time, device, value)
            VALUES (?, ?, ?)",
            )
            .bind(o.date_time)
            .bind(o.device.as_str())
            .bind(o.value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
    async fn close(mut self: Box<Self>) -> Result<(), SinkError> {
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use chrono::{DateTime, TimeZone, Utc};
    use sqlx::{
        Row,
        sqlite::{SqlitePoolOptions, SqliteRow},
    };

    use blelog_domain::{device::DeviceId, observation::Observation};

    use crate::history::ObservationSink;

    use super::SqliteObservationSink;

    #[tokio::test]
    async fn sink_multiple_observations() {
        let observations = vec![
            Observation::new(
                Utc.timestamp_opt(1, 0).unwrap(),
                DeviceId::new("00:00:00:00:00:01"),
                20,
            ),
            Observation::new(
                Utc.timestamp_opt(2, 0).unwrap(),
                DeviceId::new("00:00:00:00:00:02"),
                -30,
            ),
        ];

        let pool = Arc::new(
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect("sqlite::memory:")
                .await
                .unwrap(),
        );
        let mut sink = SqliteObservationSink::create_from_pool(pool.clone())
            .await
            .unwrap();
        sink.save(&observations).await.unwrap();
        let rows = sqlx::query("SELECT date_time, device, value FROM observations ORDER BY date_time;")
            .fetch_all(&*pool)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_row_eq(&rows[0], &observations[0]);
        assert_row_eq(&rows[1], &observations[1]);
    }

    fn assert_row_eq(actual: &SqliteRow, expected: &Observation) {
        let actual_date_time: DateTime<Utc> = actual.get(0);
        assert_eq!(actual_date_time, expected.date_time);
        let actual_device: String = actual.get(1);
        assert_eq!(actual_device, expected.device.as_str());
        let actual_value: i32 = actual.get(2);
        assert_eq!(actual_value, expected.value);
    }
}
