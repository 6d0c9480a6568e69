//! Scripted adapter for federation tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use atmofed::adapters::Adapter;
use atmofed::error::AdapterError;
use atmofed::model::{NormalizedRecord, PayloadHandle, Query, Ri, Station, TimeInterval, TimeSeries};

/// How every call to the mock behaves.
#[derive(Debug, Clone)]
pub enum Behaviour {
    /// Answer from the canned data
    Succeed,
    /// Fail with `Unavailable` on every attempt
    AlwaysUnavailable,
    /// Fail with `Unavailable` this many times, then succeed
    UnavailableTimes(u32),
    /// Fail with a schema error carrying this raw response
    Schema(String),
}

pub struct MockAdapter {
    ri: Ri,
    known: BTreeSet<String>,
    stations: Vec<Station>,
    records: Vec<NormalizedRecord>,
    payload: Option<TimeSeries>,
    behaviour: Behaviour,
    delay: Duration,
    calls: AtomicU32,
    queries: Mutex<Vec<Query>>,
}

impl MockAdapter {
    pub fn new<I, S>(ri: Ri, known: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ri,
            known: known.into_iter().map(Into::into).collect(),
            stations: Vec::new(),
            records: Vec::new(),
            payload: None,
            behaviour: Behaviour::Succeed,
            delay: Duration::ZERO,
            calls: AtomicU32::new(0),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn with_station(mut self, station: Station) -> Self {
        self.stations.push(station);
        self
    }

    /// Add a record; its station is added to the discoverable stations too.
    pub fn with_record(mut self, record: NormalizedRecord) -> Self {
        if !self.stations.iter().any(|s| s.key == record.station.key) {
            self.stations.push(record.station.clone());
        }
        self.records.push(record);
        self
    }

    pub fn with_payload(mut self, series: TimeSeries) -> Self {
        self.payload = Some(series);
        self
    }

    pub fn with_behaviour(mut self, behaviour: Behaviour) -> Self {
        self.behaviour = behaviour;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Sub-queries received, in call order
    pub fn queries(&self) -> Vec<Query> {
        self.queries.lock().clone()
    }

    async fn enter(&self, query: Option<&Query>) -> Result<(), AdapterError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(query) = query {
            self.queries.lock().push(query.clone());
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.behaviour {
            Behaviour::Succeed => Ok(()),
            Behaviour::AlwaysUnavailable => Err(AdapterError::unavailable(
                self.ri,
                format!("HTTP 503 on call {}", call),
            )),
            Behaviour::UnavailableTimes(n) if call <= *n => Err(AdapterError::unavailable(
                self.ri,
                format!("connection reset on call {}", call),
            )),
            Behaviour::UnavailableTimes(_) => Ok(()),
            Behaviour::Schema(raw) => Err(AdapterError::schema(
                self.ri,
                "missing field 'results'",
                raw,
            )),
        }
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    fn ri(&self) -> Ri {
        self.ri
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn known_variables(&self) -> BTreeSet<String> {
        self.known.clone()
    }

    async fn discover(&self, query: &Query) -> Result<Vec<Station>, AdapterError> {
        self.enter(Some(query)).await?;
        Ok(self
            .stations
            .iter()
            .filter(|s| query.admits_station(s))
            .cloned()
            .collect())
    }

    async fn fetch_records(&self, query: &Query) -> Result<Vec<NormalizedRecord>, AdapterError> {
        self.enter(Some(query)).await?;
        Ok(self
            .records
            .iter()
            .filter(|r| query.is_wildcard() || query.variables.contains(&r.variable.name))
            .filter(|r| query.admits_station(&r.station))
            .filter(|r| query.admits_coverage(&r.dataset.coverage))
            .cloned()
            .collect())
    }

    async fn fetch_payload(
        &self,
        handle: &PayloadHandle,
        interval: Option<&TimeInterval>,
    ) -> Result<TimeSeries, AdapterError> {
        self.enter(None).await?;
        let mut series = self
            .payload
            .clone()
            .ok_or_else(|| AdapterError::unavailable(self.ri, "no payload scripted"))?;
        series.station_id = handle.station_id.clone();
        if let Some(interval) = interval {
            series.observations.retain(|o| interval.contains(&o.time));
        }
        Ok(series)
    }
}
