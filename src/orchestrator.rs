// src/orchestrator.rs
//
// The display state machine. One instance per process; the router, the
// connector dispatcher and the HTTP surface all hold it by `Arc`.
//
// Every state mutation happens under `state`. Broker traffic that must pair
// atomically with a context swap (unsubscribe old, subscribe new, wakeup)
// runs inside the lock; plain publishes and idle polls run outside it.

use std::{
    mem,
    sync::{Arc, Weak},
    time::Duration,
};
use async_trait::async_trait;
use connector_plugin::{attributes, Attributes, Broker, BrokerError, EventPublisher};
use tokio::{
    sync::{watch, Mutex},
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    catalog::{AppDescriptor, AppRegistry, CatalogLoader},
    config::Settings,
    error::ConfigurationError,
    message_board::MessageBoard,
    run_queue::RunQueue,
    subscription::SubscriptionManager,
};

/// Target of the structured event emitted on every context switch.
pub const SWITCH_TARGET: &str = "coffeeshop::switch";

const MIN_IDLE_PERIOD: Duration = Duration::from_secs(1);
const MAX_IDLE_PERIOD: Duration = Duration::from_secs(2 * 86_400);

struct IdleTimer {
    cancel: CancellationToken,
}

struct State {
    registry: Arc<AppRegistry>,
    context: Arc<AppDescriptor>,
    queue: RunQueue,
    context_changed: bool,
    activity_observed: bool,
    config_changed: bool,
    idle_timer: Option<IdleTimer>,
    /// Bumped on every switch and restart so a stale idle check can tell.
    generation: u64,
    running: bool,
}

/// What an idle check concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleVerdict {
    /// The application is in use; nothing happened.
    Active,
    /// The application looked idle and a switch was attempted. `switched`
    /// is false when nothing was queued.
    Idle { switched: bool },
    /// The context changed (or the orchestrator stopped) while polling.
    Stale,
}

pub struct Orchestrator {
    settings: Settings,
    loader: Arc<dyn CatalogLoader>,
    subscriptions: SubscriptionManager,
    board: Arc<MessageBoard>,
    state: Mutex<State>,
    context_tx: watch::Sender<Arc<AppDescriptor>>,
    me: Weak<Orchestrator>,
}

impl Orchestrator {
    /// Load the catalog, take the broker subscriptions and start the idle
    /// timer. A catalog that fails to load is fatal.
    pub async fn start(
        settings: Settings,
        loader: Arc<dyn CatalogLoader>,
        broker: Arc<dyn Broker>,
    ) -> Result<Arc<Self>, ConfigurationError> {
        let registry = Arc::new(loader.load()?.with_version(1));
        let default = registry.default_app().clone();
        let (context_tx, _) = watch::channel(default.clone());
        let subscriptions = SubscriptionManager::new(broker.clone(), &settings.client_name);
        let board = Arc::new(MessageBoard::new(
            broker,
            &settings.board_client_name,
            &settings.board_topic,
        ));

        let orchestrator = Arc::new_cyclic(|me| Self {
            settings,
            loader,
            subscriptions,
            board,
            state: Mutex::new(State {
                registry,
                context: default,
                queue: RunQueue::new(),
                context_changed: false,
                activity_observed: false,
                config_changed: false,
                idle_timer: None,
                generation: 0,
                running: false,
            }),
            context_tx,
            me: me.clone(),
        });

        {
            let mut state = orchestrator.state.lock().await;
            orchestrator.bring_up(&mut state).await;
        }
        info!(
            "Orchestrator started with {} on screen",
            orchestrator.current_application().id
        );
        Ok(orchestrator)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn message_board(&self) -> &Arc<MessageBoard> {
        &self.board
    }

    /// The application on screen.
    pub fn current_application(&self) -> Arc<AppDescriptor> {
        self.context_tx.borrow().clone()
    }

    /// Receives the new context after every switch or restart.
    pub fn subscribe_context(&self) -> watch::Receiver<Arc<AppDescriptor>> {
        self.context_tx.subscribe()
    }

    pub async fn registry(&self) -> Arc<AppRegistry> {
        self.state.lock().await.registry.clone()
    }

    pub async fn queued_applications(&self) -> Vec<Arc<AppDescriptor>> {
        self.state.lock().await.queue.snapshot()
    }

    /// Topics the orchestrator's own client holds, sorted.
    pub fn active_topics(&self) -> Vec<String> {
        self.subscriptions.active_topics()
    }

    /// Put `running[index]` on the run queue. Out-of-range indices are
    /// logged and ignored. Returns whether the index resolved.
    pub async fn queue_application(&self, index: usize) -> bool {
        let mut state = self.state.lock().await;
        let Some(app) = state.registry.running_at(index).cloned() else {
            info!(
                "Someone tried to select an application that has not been configured. ID: {}",
                index
            );
            return false;
        };
        if state.queue.enqueue(app.clone()) {
            info!("Application queued: {}", app.name);
        } else {
            debug!("{} is already queued", app.id);
        }
        true
    }

    /// Traffic arrived on the current application's own topic.
    pub async fn notify_activity(&self) {
        self.state.lock().await.activity_observed = true;
    }

    /// True exactly once per switch.
    pub async fn is_context_change(&self) -> bool {
        mem::take(&mut self.state.lock().await.context_changed)
    }

    pub async fn is_config_changed(&self) -> bool {
        self.state.lock().await.config_changed
    }

    /// Read and clear the configuration-changed flag.
    pub async fn take_config_changed(&self) -> bool {
        mem::take(&mut self.state.lock().await.config_changed)
    }

    /// `true` reloads the catalog and restarts from the default application;
    /// `false` only clears the flag. A catalog that fails to reload leaves
    /// the running configuration untouched.
    pub async fn set_config_changed(&self, changed: bool) -> Result<(), ConfigurationError> {
        let mut state = self.state.lock().await;
        if !changed {
            state.config_changed = false;
            return Ok(());
        }

        info!("Resetting configuration...");
        let registry = match self.loader.load() {
            Ok(registry) => registry.with_version(state.registry.version() + 1),
            Err(e) => {
                error!(
                    "Catalog reload failed, keeping version {}: {}",
                    state.registry.version(),
                    e
                );
                return Err(e);
            }
        };

        self.tear_down(&mut state).await;
        let registry = Arc::new(registry);
        let default = registry.default_app().clone();
        state.registry = registry;
        state.queue = RunQueue::new();
        state.context = default.clone();
        state.context_changed = false;
        self.context_tx.send_replace(default);
        self.bring_up(&mut state).await;
        state.config_changed = true;
        info!("Configuration version {} in service", state.registry.version());
        Ok(())
    }

    /// Dequeue the next application and put it on screen. With nothing
    /// queued the current application keeps running.
    pub async fn do_context_switch(&self) -> bool {
        let mut state = self.state.lock().await;
        self.switch_locked(&mut state).await
    }

    /// One tick of the idle timer.
    pub async fn idle_check(&self) -> IdleVerdict {
        let (topic, pass_through, generation) = {
            let state = self.state.lock().await;
            if !state.running {
                return IdleVerdict::Stale;
            }
            (
                state.context.topic().to_string(),
                state.context.uses_pass_through(),
                state.generation,
            )
        };

        let polled = self.subscriptions.poll(&topic, self.settings.idle_poll).await;

        let mut state = self.state.lock().await;
        if !state.running || state.generation != generation {
            return IdleVerdict::Stale;
        }
        let idle = match polled {
            Err(e) => {
                warn!("Could not check for events during context switch: {}", e);
                true
            }
            Ok(events) if pass_through => events.is_empty(),
            Ok(_) => !mem::take(&mut state.activity_observed),
        };
        if !idle {
            return IdleVerdict::Active;
        }
        state.activity_observed = false;
        let switched = self.switch_locked(&mut state).await;
        IdleVerdict::Idle { switched }
    }

    /// Unsubscribe everything, release the broker client and stop the
    /// timer. Safe to call twice.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if !state.running {
            return;
        }
        info!("Shutting down...");
        self.tear_down(&mut state).await;
        self.subscriptions.release().await;
        info!("Shutdown Complete");
    }

    fn delivery_url(&self, app: &AppDescriptor) -> Option<String> {
        if app.uses_pass_through() {
            None
        } else {
            Some(self.settings.ingress_url())
        }
    }

    async fn bring_up(&self, state: &mut State) {
        let ingress = self.settings.ingress_url();
        self.board.subscribe().await;
        self.subscriptions
            .subscribe(&self.settings.menu_topic, Some(&ingress))
            .await;
        let context = state.context.clone();
        self.subscriptions
            .subscribe(context.topic(), self.delivery_url(&context).as_deref())
            .await;
        self.subscriptions
            .subscribe(&self.settings.sms_topic, Some(&ingress))
            .await;
        self.subscriptions
            .subscribe(&self.settings.osn_topic, Some(&ingress))
            .await;
        state.running = true;
        state.generation += 1;
        self.start_timer(state);
    }

    async fn tear_down(&self, state: &mut State) {
        Self::stop_timer(state);
        self.subscriptions.unsubscribe_all().await;
        self.board.unsubscribe().await;
        state.running = false;
        state.generation += 1;
        debug!("subscriptions released, idle timer stopped");
    }

    async fn switch_locked(&self, state: &mut State) -> bool {
        let previous = state.context.clone();
        let next = match state.queue.dequeue() {
            Ok(app) => app,
            Err(_) => {
                debug!("Nothing queued, {} keeps running", previous.id);
                return false;
            }
        };

        Self::stop_timer(state);
        self.subscriptions.unsubscribe(previous.topic()).await;
        state.context = next.clone();
        self.subscriptions
            .subscribe(next.topic(), self.delivery_url(&next).as_deref())
            .await;

        if !next.uses_pass_through() {
            let wakeup = attributes([("message", "wakeup")]);
            if let Err(e) = self.subscriptions.publish(next.topic(), &wakeup).await {
                error!("Could not send wakeup message to topic {}: {}", next.topic(), e);
            }
        }

        state.activity_observed = false;
        state.generation += 1;
        self.start_timer(state);
        state.context_changed = true;
        self.context_tx.send_replace(next.clone());

        info!(
            target: SWITCH_TARGET,
            from = %previous.id,
            to = %next.id,
            connector = %next.connector(),
            queued = state.queue.len(),
            "Context switch occurred to application: {}",
            next.name
        );
        true
    }

    fn start_timer(&self, state: &mut State) {
        Self::stop_timer(state);
        let first = state.context.idle_timeout();
        let period = first
            .saturating_add(self.settings.idle_grace)
            .clamp(MIN_IDLE_PERIOD, MAX_IDLE_PERIOD);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let weak = self.me.clone();
        let app = state.context.id.clone();

        tokio::spawn(async move {
            let start = Instant::now()
                .checked_add(first.min(MAX_IDLE_PERIOD))
                .unwrap_or_else(Instant::now);
            let mut ticker = interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(orchestrator) = weak.upgrade() else {
                    break;
                };
                let verdict = orchestrator.idle_check().await;
                debug!("idle check for {}: {:?}", app, verdict);
            }
            debug!("idle timer for {} stopped", app);
        });
        state.idle_timer = Some(IdleTimer { cancel });
        debug!("idle timer armed: first check in {:?}, then every {:?}", first, period);
    }

    fn stop_timer(state: &mut State) {
        if let Some(timer) = state.idle_timer.take() {
            timer.cancel.cancel();
        }
    }
}

#[async_trait]
impl EventPublisher for Orchestrator {
    /// Publish to whichever application is on screen.
    async fn publish_event(&self, attributes: Attributes) -> Result<(), BrokerError> {
        let topic = self.current_application().topic().to_string();
        self.subscriptions.publish(&topic, &attributes).await
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("context", &self.current_application().id)
            .field("subscriptions", &self.subscriptions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::InMemoryBroker,
        catalog::{tests::app, StaticCatalogLoader},
    };

    fn registry() -> AppRegistry {
        AppRegistry::new(
            app("wall", "default", 30),
            vec![
                app("quiz", "default", 30),
                app("counter", "heartbeat", 30),
                app("poll", "default", 30),
            ],
            vec![app("old", "default", 30)],
        )
        .unwrap()
    }

    async fn start() -> (InMemoryBroker, Arc<Orchestrator>) {
        let broker = InMemoryBroker::new();
        let orchestrator = Orchestrator::start(
            Settings {
                idle_poll: Duration::from_millis(20),
                ..Settings::default()
            },
            Arc::new(StaticCatalogLoader::new(registry())),
            Arc::new(broker.clone()),
        )
        .await
        .unwrap();
        (broker, orchestrator)
    }

    #[tokio::test]
    async fn test_startup_subscriptions() {
        let (broker, orchestrator) = start().await;
        assert_eq!(orchestrator.current_application().id, "wall");
        assert_eq!(
            broker.topics_of("coffeeshop"),
            vec!["coffeeshop_menu", "osn", "sms", "wall_topic"]
        );
        assert_eq!(broker.delivery_url("coffeeshop", "wall_topic"), None);
        assert_eq!(
            broker.delivery_url("coffeeshop", "sms").as_deref(),
            Some("http://localhost:8080/CoffeeShop/coffeeShop.do")
        );
        assert!(broker.is_subscribed("messageboard", "messageboard"));
        assert_eq!(orchestrator.registry().await.version(), 1);
    }

    #[tokio::test]
    async fn test_queue_application_bounds() {
        let (_broker, orchestrator) = start().await;
        assert!(orchestrator.queue_application(2).await);
        assert!(orchestrator.queue_application(2).await);
        assert!(!orchestrator.queue_application(99).await);

        let queued: Vec<_> = orchestrator
            .queued_applications()
            .await
            .iter()
            .map(|a| a.id.clone())
            .collect();
        assert_eq!(queued, vec!["poll"]);
    }

    #[tokio::test]
    async fn test_switch_to_custom_connector_sends_wakeup() {
        let (broker, orchestrator) = start().await;
        let mut rx = broker.bind_delivery("http://localhost:8080/CoffeeShop/coffeeShop.do");
        orchestrator.queue_application(1).await;

        assert!(orchestrator.do_context_switch().await);
        assert_eq!(orchestrator.current_application().id, "counter");
        assert!(!broker.is_subscribed("coffeeshop", "wall_topic"));
        assert!(broker.delivery_url("coffeeshop", "counter_topic").is_some());

        let wakeup = rx.recv().await.unwrap();
        assert_eq!(wakeup.topic, "counter_topic");
        assert_eq!(wakeup.attribute("message"), Some("wakeup"));
    }

    #[tokio::test]
    async fn test_publish_event_goes_to_context_topic() {
        let (broker, orchestrator) = start().await;
        orchestrator
            .publish_event(attributes([("message", "hello")]))
            .await
            .unwrap();
        assert_eq!(broker.published_on("wall_topic")[0]["message"], "hello");
    }

    #[tokio::test]
    async fn test_context_watch_follows_switches() {
        let (_broker, orchestrator) = start().await;
        let mut rx = orchestrator.subscribe_context();
        orchestrator.queue_application(0).await;
        orchestrator.do_context_switch().await;
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().id, "quiz");
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (broker, orchestrator) = start().await;
        orchestrator.shutdown().await;
        orchestrator.shutdown().await;
        assert!(broker.topics_of("coffeeshop").is_empty());
        assert!(!broker.is_subscribed("messageboard", "messageboard"));
        assert_eq!(orchestrator.idle_check().await, IdleVerdict::Stale);
    }
}
