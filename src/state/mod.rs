pub mod clock;
pub mod notification;
pub mod race;
pub mod sse;
pub mod state_machine;
pub mod transitions;

use std::{sync::Arc, time::SystemTime};

use tokio::sync::{RwLock, watch};
use tracing::warn;

use crate::{
    config::AppConfig,
    dao::race_store::RaceStore,
    dto::sse::{ServerEvent, SystemStatus},
    error::ServiceError,
    services::push::{PushSender, SsePushSender},
};

pub use self::sse::{NotificationHub, SseHub};
use self::{
    clock::{Clock, SystemClock},
    sse::SseState,
};

pub type SharedState = Arc<AppState>;

const EVENT_SYSTEM_STATUS: &str = "system.status";
const RACES_SSE_CAPACITY: usize = 64;
const NOTIFICATIONS_SSE_CAPACITY: usize = 256;

/// Central application state: storage handle, push transport, SSE hubs and settings.
///
/// No race data lives here; every read goes through the store.
pub struct AppState {
    race_store: RwLock<Option<Arc<dyn RaceStore>>>,
    sse: SseState,
    push: Arc<dyn PushSender>,
    degraded: watch::Sender<bool>,
    config: AppConfig,
    clock: Arc<dyn Clock>,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    ///
    /// Notifications go to the per-user SSE streams and the wall clock drives time.
    /// The application starts in degraded mode until a storage backend is installed.
    pub fn new(config: AppConfig) -> SharedState {
        Self::builder(config).build()
    }

    /// Start building a state with custom collaborators.
    pub fn builder(config: AppConfig) -> AppStateBuilder {
        AppStateBuilder {
            config,
            push: None,
            clock: None,
        }
    }

    /// Obtain a handle to the current race store, if one is installed.
    pub async fn race_store(&self) -> Option<Arc<dyn RaceStore>> {
        let guard = self.race_store.read().await;
        guard.as_ref().cloned()
    }

    /// Current race store or [`ServiceError::Degraded`].
    pub async fn require_race_store(&self) -> Result<Arc<dyn RaceStore>, ServiceError> {
        self.race_store().await.ok_or(ServiceError::Degraded)
    }

    /// Install a new race store implementation and leave degraded mode.
    pub async fn install_race_store(&self, store: Arc<dyn RaceStore>) {
        {
            let mut guard = self.race_store.write().await;
            *guard = Some(store);
        }
        self.set_degraded(false);
    }

    /// Remove the current race store and enter degraded mode.
    pub async fn clear_race_store(&self) {
        {
            let mut guard = self.race_store.write().await;
            guard.take();
        }
        self.set_degraded(true);
    }

    /// Current degraded flag.
    pub fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Subscribe to degraded mode updates.
    pub fn degraded_watcher(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    /// Update the degraded flag, announcing changes on the race stream.
    pub fn set_degraded(&self, value: bool) {
        let changed = self.degraded.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        });

        if changed {
            match ServerEvent::json(
                Some(EVENT_SYSTEM_STATUS.to_string()),
                &SystemStatus { degraded: value },
            ) {
                Ok(event) => self.race_sse().broadcast(event),
                Err(err) => warn!(error = %err, "failed to serialize system status event"),
            }
        }
    }

    /// Broadcast hub used for the public race stream.
    pub fn race_sse(&self) -> &SseHub {
        self.sse.races()
    }

    /// Hub feeding the per-user notification streams.
    pub fn notification_hub(&self) -> &NotificationHub {
        self.sse.notifications()
    }

    /// Transport used by the dispatcher.
    pub fn push(&self) -> Arc<dyn PushSender> {
        self.push.clone()
    }

    /// Runtime configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Current instant according to the injected clock.
    pub fn now(&self) -> SystemTime {
        self.clock.now()
    }
}

/// Builder for [`AppState`], mostly useful to inject a push transport or a test clock.
pub struct AppStateBuilder {
    config: AppConfig,
    push: Option<Arc<dyn PushSender>>,
    clock: Option<Arc<dyn Clock>>,
}

impl AppStateBuilder {
    pub fn push(mut self, push: Arc<dyn PushSender>) -> Self {
        self.push = Some(push);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> SharedState {
        let (degraded_tx, _rx) = watch::channel(true);
        let sse = SseState::new(RACES_SSE_CAPACITY, NOTIFICATIONS_SSE_CAPACITY);
        let push = self
            .push
            .unwrap_or_else(|| Arc::new(SsePushSender::new(sse.notifications().clone())));

        Arc::new(AppState {
            race_store: RwLock::new(None),
            sse,
            push,
            degraded: degraded_tx,
            config: self.config,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        })
    }
}
