/*
    Persistence sink. Controllers hand finished measurement sets to the
    sink and move on; the sink thread writes them to the store and deals
    with store failures on its own.
*/
use crate::core::broadcast_channel::{GenericReceiver, GenericSender};
use crate::core::channel_manager::ChannelManager;
use crate::core::SystemMessage;
use crate::measurement::MeasurementSet;
use crate::trace::{trace_helper::TraceHelper, STORE_CONNECTION};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq)]
pub struct PersistRequest
{
    pub input_id: String,
    pub measurements: MeasurementSet
}

#[derive(Debug, Error)]
pub enum StoreError
{
    #[error("no connection to measurement store: {0}")]
    ConnectionLost(String),
    #[error("cannot write measurements: {0}")]
    Write(String)
}

/// Backend the sink writes to.
#[cfg_attr(test, mockall::automock)]
pub trait MeasurementStore: Send
{
    fn write(&mut self, input_id: &str, measurements: &MeasurementSet) -> Result<(), StoreError>;
}

/// Fire-and-forget persistence as seen by the controllers.
#[cfg_attr(test, mockall::automock)]
pub trait MeasurementSink: Send + Sync
{
    fn persist(&self, input_id: &str, measurements: MeasurementSet);
}

/// `MeasurementSink` publishing `PersistRequest`s to the sink thread.
#[derive(Clone)]
pub struct PersistenceBus
{
    requests: GenericSender<PersistRequest>
}

impl PersistenceBus
{
    pub fn new(chm: &ChannelManager) -> Self
    {
        PersistenceBus { requests: chm.get_sender() }
    }
}

impl MeasurementSink for PersistenceBus
{
    fn persist(&self, input_id: &str, measurements: MeasurementSet)
    {
        self.requests.send(PersistRequest { input_id: input_id.to_string(), measurements });
    }
}

#[derive(Serialize)]
struct StoredPoint<'a>
{
    input_id: &'a str,
    channel: u32,
    value: f64,
    unit: &'a str,
    timestamp: DateTime<Utc>
}

/// # JsonLinesStore
/// Appends one JSON object per channel and measurement to a file. The
/// directory holding the file plays the role of the store service: if
/// it is gone, the store counts as unreachable.
pub struct JsonLinesStore
{
    path: PathBuf
}

impl JsonLinesStore
{
    pub fn new(path: impl AsRef<Path>) -> Self
    {
        JsonLinesStore { path: path.as_ref().to_path_buf() }
    }
}

impl MeasurementStore for JsonLinesStore
{
    fn write(&mut self, input_id: &str, measurements: &MeasurementSet) -> Result<(), StoreError>
    {
        let mut file = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&self.path)
                        .map_err(|e| match e.kind()
                        {
                            ErrorKind::NotFound => StoreError::ConnectionLost(format!("{}: {}", self.path.display(), e)),
                            _ => StoreError::Write(format!("{}: {}", self.path.display(), e))
                        })?;

        let mut lines = String::new();
        for (channel, m) in measurements.iter()
        {
            let point = StoredPoint { input_id, channel: *channel, value: m.value, unit: &m.unit, timestamp: m.timestamp };
            let line = serde_json::to_string(&point).map_err(|e| StoreError::Write(e.to_string()))?;
            lines.push_str(&line);
            lines.push('\n');
        }
        file.write_all(lines.as_bytes()).map_err(|e| StoreError::Write(e.to_string()))
    }
}

/// Spawns the sink thread. It stops on `SystemMessage::Shutdown` after
/// writing whatever was still queued.
pub fn launch(chm: &ChannelManager, store: Box<dyn MeasurementStore>) -> std::io::Result<thread::JoinHandle<()>>
{
    let mut sink = PersistenceSink::new(TraceHelper::new("STORE/Sink".to_string()), chm, store);
    let system_events = chm.get_receiver::<SystemMessage>();
    thread::Builder::new().name("persistence".to_string()).spawn(move || {
        loop
        {
            if let Some(SystemMessage::Shutdown) = system_events.try_receive()
            {
                break;
            }
            sink.run_once(Duration::from_millis(100));
        }
        sink.drain();
    })
}

pub struct PersistenceSink
{
    requests: GenericReceiver<PersistRequest>,
    store: Box<dyn MeasurementStore>,
    tracer: TraceHelper
}

impl PersistenceSink
{
    pub fn new(tracer: TraceHelper, chm: &ChannelManager, store: Box<dyn MeasurementStore>) -> Self
    {
        PersistenceSink { requests: chm.get_receiver(), store, tracer }
    }

    pub fn run_once(&mut self, timeout: Duration) -> bool
    {
        match self.requests.receive_with_timeout(timeout)
        {
            Some(req) => { self.write(req); true }
            None => false
        }
    }

    pub fn drain(&mut self)
    {
        while let Some(req) = self.requests.try_receive()
        {
            self.write(req);
        }
    }

    fn write(&mut self, req: PersistRequest)
    {
        match self.store.write(&req.input_id, &req.measurements)
        {
            Ok(()) => self.tracer.trace(format!("Stored {} measurement(s) of {}", req.measurements.len(), req.input_id)),
            Err(e @ StoreError::ConnectionLost(_)) => self.tracer.error_in(STORE_CONNECTION, format!("Input {}: {}", req.input_id, e)),
            Err(e) => self.tracer.error(format!("Input {}: {}", req.input_id, e))
        }
    }
}
