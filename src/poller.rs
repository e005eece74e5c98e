//! The timed poll loop: connect, fetch, decode, commit, diff, push.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use parking_lot::RwLock;
use tokio::time::{MissedTickBehavior, interval};

use crate::accessory::UpsAccessory;
use crate::apcaccess::{ConnectError, Connection, FetchError, RawStatus, StatusClient};
use crate::decoder::{self, DecodeSoftError, Decoded, DecodedState, FIELD_ITEMP};
use crate::metrics::Metrics;
use crate::tracker::{ChangeEvent, StateTracker};

/// Where status reports come from.
pub trait StatusSource {
    type Connection: Send;

    fn connect(&self) -> impl Future<Output = Result<Self::Connection, ConnectError>> + Send;

    fn fetch(
        &self,
        conn: &mut Self::Connection,
    ) -> impl Future<Output = Result<RawStatus, FetchError>> + Send;

    fn describe(&self) -> String;
}

impl StatusSource for StatusClient {
    type Connection = Connection;

    async fn connect(&self) -> Result<Connection, ConnectError> {
        StatusClient::connect(self).await
    }

    async fn fetch(&self, conn: &mut Connection) -> Result<RawStatus, FetchError> {
        self.fetch_status(conn).await
    }

    fn describe(&self) -> String {
        self.addr()
    }
}

/// The committed view readers see. Replaced whole, never edited.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// False until the first successful poll; the state is all zero values until then.
    pub ready: bool,
    pub state: DecodedState,
    pub raw: RawStatus,
}

#[derive(Debug, Default)]
pub struct SnapshotStore {
    current: RwLock<Arc<Snapshot>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> Arc<Snapshot> {
        self.current.read().clone()
    }

    /// Publish a new snapshot. Returns true if this was the first one.
    pub fn commit(&self, state: DecodedState, raw: RawStatus) -> bool {
        let next = Arc::new(Snapshot {
            ready: true,
            state,
            raw,
        });
        let previous = std::mem::replace(&mut *self.current.write(), next);
        !previous.ready
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, PartialEq, Eq)]
pub enum TickOutcome {
    ConnectFailed,
    FetchFailed,
    Polled(Vec<ChangeEvent>),
}

pub struct Poller<S: StatusSource> {
    source: S,
    conn: Option<S::Connection>,
    state: PollState,
    tracker: StateTracker,
    store: Arc<SnapshotStore>,
    accessory: Arc<UpsAccessory>,
    metrics: Arc<Metrics>,
    failing_fields: HashSet<&'static str>,
    failed_connects: u32,
}

impl<S: StatusSource> Poller<S> {
    pub fn new(
        source: S,
        store: Arc<SnapshotStore>,
        accessory: Arc<UpsAccessory>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Poller {
            source,
            conn: None,
            state: PollState::Disconnected,
            tracker: StateTracker::new(),
            store,
            accessory,
            metrics,
            failing_fields: HashSet::new(),
            failed_connects: 0,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> PollState {
        self.state
    }

    /// Poll forever, one tick per `period`. A slow tick delays the next one
    /// rather than overlapping it.
    pub async fn run(mut self, period: Duration) {
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            timer.tick().await;
            self.tick().await;
        }
    }

    pub async fn tick(&mut self) -> TickOutcome {
        if self.state != PollState::Connected && !self.connect().await {
            return TickOutcome::ConnectFailed;
        }
        let Some(conn) = self.conn.as_mut() else {
            return TickOutcome::ConnectFailed;
        };

        match self.source.fetch(conn).await {
            Ok(raw) => TickOutcome::Polled(self.commit(raw)),
            Err(e) => {
                error!("Polling UPS service failed: {}", e);
                self.conn = None;
                self.state = PollState::Disconnected;
                self.metrics.record_failure("fetch");
                TickOutcome::FetchFailed
            }
        }
    }

    async fn connect(&mut self) -> bool {
        self.state = PollState::Connecting;
        match self.source.connect().await {
            Ok(conn) => {
                if self.failed_connects > 0 {
                    info!(
                        "Connected to {} after {} failed attempts",
                        self.source.describe(),
                        self.failed_connects
                    );
                } else {
                    info!("Connected to {}", self.source.describe());
                }
                self.failed_connects = 0;
                self.conn = Some(conn);
                self.state = PollState::Connected;
                true
            }
            Err(e) => {
                self.failed_connects += 1;
                if self.failed_connects == 1 {
                    error!("Couldn't connect to service: {}", e);
                } else {
                    debug!("Still unable to connect (attempt {}): {}", self.failed_connects, e);
                }
                self.state = PollState::Disconnected;
                self.metrics.record_failure("connect");
                false
            }
        }
    }

    fn commit(&mut self, raw: RawStatus) -> Vec<ChangeEvent> {
        debug!("Received {} status fields", raw.len());
        let Decoded { state, soft_errors } = decoder::decode(&raw);
        self.log_soft_errors(&soft_errors);
        self.metrics.observe(&state, &raw);

        let events = self.tracker.observe(&state);
        if self.store.commit(state, raw) {
            info!("First status report received");
        }
        self.accessory.publish(&events);
        events
    }

    /// Log each failing field once when it starts failing and once when it recovers.
    fn log_soft_errors(&mut self, soft_errors: &[DecodeSoftError]) {
        let temperature_sensor = self.accessory.has_temperature_sensor();
        let relevant: Vec<&DecodeSoftError> = soft_errors
            .iter()
            .filter(|e| temperature_sensor || e.field() != FIELD_ITEMP)
            .collect();

        let failing: HashSet<&'static str> = relevant.iter().map(|e| e.field()).collect();
        for e in &relevant {
            if !self.failing_fields.contains(e.field()) {
                error!("Unable to determine {}: {}", e.field(), e);
            }
        }
        for field in self.failing_fields.difference(&failing) {
            info!("{} is being reported again", field);
        }
        self.failing_fields = failing;
    }
}
