use std::{fs::OpenOptions, io::Write, path::Path};

use async_trait::async_trait;

use blelog_domain::observation::Observation;

use super::{ObservationSink, SinkError};

pub struct JsonLinesObservationSink<'a> {
    writer: Box<dyn Write + Send + 'a>,
}

impl<'a> JsonLinesObservationSink<'a> {
    pub fn create_from_writer(writer: Box<dyn Write + Send + 'a>) -> JsonLinesObservationSink<'a> {
        JsonLinesObservationSink { writer }
    }
}

impl JsonLinesObservationSink<'static> {
    pub fn append_to_file<P>(path_arg: P) -> Result<JsonLinesObservationSink<'static>, SinkError>
    where
        P: AsRef<Path>,
    {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path_arg.as_ref())?;
        Ok(JsonLinesObservationSink::create_from_writer(Box::new(file)))
    }
}

#[async_trait]
impl<'a> ObservationSink for JsonLinesObservationSink<'a> {
    async fn save(&mut self, observations: &[Observation]) -> Result<(), SinkError> {
        let w = &mut self.writer;
        for observation in observations {
            serde_json::to_writer(&mut *w, observation)?;
            writeln!(w)?;
        }
        w.flush()?;
        Ok(())
    }
    async fn close(mut self: Box<Self>) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}
