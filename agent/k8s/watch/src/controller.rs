use crate::{
    client::ResourceClient,
    errors::ErrorSink,
    metrics::{Action, WatchMetrics},
    store::{ObjectKey, Store},
    versioned::VersionedMap,
};
#[cfg(test)]
use crate::client::ListPage;
use anyhow::Result;
use futures::StreamExt;
use kube::core::WatchEvent;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, trace, warn};

const PAGE_SIZE: u32 = 50;
const LIST_RETRY_DELAY: Duration = Duration::from_secs(5);
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Reconciles one resource kind into local state.
///
/// Handler errors are logged and counted but never propagated: the next
/// resync re-delivers whatever [`EventHandler::missing`] reports.
#[async_trait::async_trait]
pub trait EventHandler<K: Send + 'static>: Send + Sync + 'static {
    async fn on_add(&self, obj: K) -> Result<()>;

    async fn on_update(&self, old: K, new: K) -> Result<()>;

    async fn on_delete(&self, obj: K) -> Result<()>;

    /// Per-resource equality deciding whether an update event is delivered.
    fn unchanged(&self, old: &K, new: &K) -> bool;

    /// Reduces a snapshot to the subset not reflected in local state.
    fn missing(&self, snapshot: &VersionedMap<K>) -> VersionedMap<K>;
}

/// A control loop for one resource kind: initial paginated list, watch with
/// per-key in-order delivery, and periodic missing-object resynthesis.
pub struct Controller<K, C, H> {
    resource: &'static str,
    client: C,
    handler: Arc<H>,
    store: Store<K>,
    resync_period: Duration,
    metrics: WatchMetrics,
    errors: Arc<ErrorSink>,
    synced_tx: watch::Sender<bool>,
}

// === impl Controller ===

impl<K, C, H> Controller<K, C, H>
where
    K: kube::Resource + Clone + std::fmt::Debug + Send + Sync + 'static,
    C: ResourceClient<K>,
    H: EventHandler<K>,
{
    /// Returns the controller and a receiver that turns true once the
    /// initial list has been delivered.
    pub fn new(
        resource: &'static str,
        client: C,
        handler: Arc<H>,
        store: Store<K>,
        resync_period: Duration,
        metrics: WatchMetrics,
        errors: Arc<ErrorSink>,
    ) -> (Self, watch::Receiver<bool>) {
        let (synced_tx, synced_rx) = watch::channel(false);
        (
            Self {
                resource,
                client,
                handler,
                store,
                resync_period,
                metrics,
                errors,
                synced_tx,
            },
            synced_rx,
        )
    }

    /// Runs until `shutdown` is signaled. Events for a single key are
    /// processed in delivery order, at most one at a time; concurrency
    /// exists only across controllers.
    pub async fn run(self, shutdown: drain::Watch) {
        let signaled = shutdown.signaled();
        tokio::pin!(signaled);

        let mut resource_version = loop {
            tokio::select! {
                _ = &mut signaled => return,
                res = self.relist() => match res {
                    Ok(version) => break version,
                    Err(error) => {
                        self.errors.observe(self.resource, &error);
                        tokio::select! {
                            _ = &mut signaled => return,
                            _ = time::sleep(LIST_RETRY_DELAY) => {}
                        }
                    }
                }
            }
        };
        let _ = self.synced_tx.send(true);
        debug!(resource = %self.resource, "initial list complete");

        let mut resync = time::interval_at(
            time::Instant::now() + self.resync_period,
            self.resync_period,
        );
        resync.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        let mut needs_relist = false;
        loop {
            if needs_relist {
                tokio::select! {
                    _ = &mut signaled => return,
                    res = self.relist() => match res {
                        Ok(version) => {
                            resource_version = version;
                            needs_relist = false;
                        }
                        Err(error) => {
                            self.errors.observe(self.resource, &error);
                            tokio::select! {
                                _ = &mut signaled => return,
                                _ = time::sleep(LIST_RETRY_DELAY) => {}
                            }
                            continue;
                        }
                    }
                }
            }

            let mut events = tokio::select! {
                _ = &mut signaled => return,
                _ = resync.tick() => {
                    self.resync().await;
                    continue;
                }
                res = self.client.watch(&resource_version) => match res {
                    Ok(events) => events,
                    Err(error) => {
                        self.errors.observe(self.resource, &error);
                        tokio::select! {
                            _ = &mut signaled => return,
                            _ = time::sleep(WATCH_RETRY_DELAY) => {}
                        }
                        continue;
                    }
                }
            };

            loop {
                tokio::select! {
                    _ = &mut signaled => return,
                    _ = resync.tick() => self.resync().await,
                    event = events.next() => match event {
                        Some(Ok(WatchEvent::Added(obj) | WatchEvent::Modified(obj))) => {
                            if let Some(version) = obj.resource_version() {
                                resource_version = version;
                            }
                            self.metrics.observe_event();
                            self.apply(obj).await;
                        }
                        Some(Ok(WatchEvent::Deleted(obj))) => {
                            if let Some(version) = obj.resource_version() {
                                resource_version = version;
                            }
                            self.metrics.observe_event();
                            self.store.remove(&ObjectKey::from_resource(&obj));
                            let result = self.handler.on_delete(obj).await;
                            self.finish(Action::Delete, result);
                        }
                        Some(Ok(WatchEvent::Bookmark(bookmark))) => {
                            resource_version = bookmark.metadata.resource_version.clone();
                        }
                        Some(Ok(WatchEvent::Error(response))) => {
                            self.errors.observe(self.resource, &response);
                            if response.code == 410 {
                                // The watch window expired; the cached
                                // resource version is unusable.
                                needs_relist = true;
                            }
                            break;
                        }
                        Some(Err(error)) => {
                            self.errors.observe(self.resource, &error);
                            break;
                        }
                        None => {
                            trace!(resource = %self.resource, "watch stream ended");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Lists all objects page by page, delivering each through the handler,
    /// and returns the list's resource version.
    async fn relist(&self) -> Result<String> {
        let mut continue_token: Option<String> = None;
        let mut resource_version = String::new();
        loop {
            let page = self
                .client
                .list_page(PAGE_SIZE, continue_token.as_deref())
                .await?;
            if let Some(version) = page.resource_version {
                resource_version = version;
            }
            for obj in page.items {
                self.apply(obj).await;
            }
            match page.continue_token {
                Some(token) => continue_token = Some(token),
                None => return Ok(resource_version),
            }
        }
    }

    /// Delivers an object as an add or, when a different object is already
    /// cached under its key, as an update. Unchanged objects are dropped.
    async fn apply(&self, obj: K) {
        let key = ObjectKey::from_resource(&obj);
        match self.store.insert(key, obj.clone()) {
            None => {
                let result = self.handler.on_add(obj).await;
                self.finish(Action::Create, result);
            }
            Some(old) => {
                if self.handler.unchanged(&old, &obj) {
                    trace!(resource = %self.resource, "dropping unchanged object");
                    return;
                }
                let result = self.handler.on_update(old, obj).await;
                self.finish(Action::Update, result);
            }
        }
    }

    /// Re-lists the resource and replays whatever the handler reports as
    /// missing from local state as synthetic adds.
    async fn resync(&self) {
        let snapshot = match self.list_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                self.errors.observe(self.resource, &error);
                return;
            }
        };

        let missing = self.handler.missing(&snapshot);
        if missing.is_empty() {
            trace!(resource = %self.resource, "resync found no missing objects");
            return;
        }

        debug!(
            resource = %self.resource,
            count = missing.len(),
            "re-adding objects missing from local state"
        );
        for (_, obj) in missing.into_iter() {
            self.store
                .insert(ObjectKey::from_resource(&obj.data), obj.data.clone());
            let result = self.handler.on_add(obj.data).await;
            self.finish(Action::Create, result);
        }
    }

    async fn list_snapshot(&self) -> Result<VersionedMap<K>> {
        let mut snapshot = VersionedMap::new();
        let mut continue_token: Option<String> = None;
        loop {
            let page = self
                .client
                .list_page(PAGE_SIZE, continue_token.as_deref())
                .await?;
            for obj in page.items {
                snapshot.insert_resource(obj);
            }
            match page.continue_token {
                Some(token) => continue_token = Some(token),
                None => return Ok(snapshot),
            }
        }
    }

    fn finish(&self, action: Action, result: Result<()>) {
        match result {
            Ok(()) => self.metrics.record(self.resource, action, true),
            Err(error) => {
                warn!(resource = %self.resource, ?action, %error, "event handler failed");
                self.metrics.record(self.resource, action, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::channel::mpsc;
    use futures::stream::BoxStream;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use parking_lot::Mutex;
    use prometheus_client::registry::Registry;
    use std::collections::BTreeMap;

    fn mk_obj(name: &str, version: &str, value: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(format!("uid-{}", name)),
                resource_version: Some(version.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("value".to_string(), value.to_string())])),
            ..Default::default()
        }
    }

    /// Serves scripted list pages and watch events.
    struct FakeClient {
        state: Arc<Mutex<FakeState>>,
    }

    #[derive(Default)]
    struct FakeState {
        objects: Vec<ConfigMap>,
        page_size: usize,
        list_calls: usize,
        watch_calls: usize,
        watch_tx: Option<mpsc::UnboundedSender<kube::Result<WatchEvent<ConfigMap>>>>,
    }

    impl FakeClient {
        fn new(objects: Vec<ConfigMap>, page_size: usize) -> (Self, Arc<Mutex<FakeState>>) {
            let state = Arc::new(Mutex::new(FakeState {
                objects,
                page_size,
                ..Default::default()
            }));
            (
                Self {
                    state: state.clone(),
                },
                state,
            )
        }
    }

    #[async_trait]
    impl ResourceClient<ConfigMap> for FakeClient {
        async fn list_page(
            &self,
            limit: u32,
            continue_token: Option<&str>,
        ) -> kube::Result<ListPage<ConfigMap>> {
            assert_eq!(limit, 50);
            let mut state = self.state.lock();
            let offset: usize = continue_token.map_or(0, |t| t.parse().unwrap());
            if offset == 0 {
                state.list_calls += 1;
            }
            let end = (offset + state.page_size).min(state.objects.len());
            let items = state.objects[offset..end].to_vec();
            let continue_token = (end < state.objects.len()).then(|| end.to_string());
            Ok(ListPage {
                items,
                continue_token,
                resource_version: Some("100".to_string()),
            })
        }

        async fn watch(
            &self,
            _resource_version: &str,
        ) -> kube::Result<BoxStream<'static, kube::Result<WatchEvent<ConfigMap>>>> {
            let (tx, rx) = mpsc::unbounded();
            let mut state = self.state.lock();
            state.watch_calls += 1;
            state.watch_tx = Some(tx);
            Ok(rx.boxed())
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        known: Mutex<std::collections::HashSet<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }

        fn forget(&self, name: &str) {
            self.known.lock().remove(name);
        }
    }

    #[async_trait]
    impl EventHandler<ConfigMap> for Recorder {
        async fn on_add(&self, obj: ConfigMap) -> Result<()> {
            let name = obj.metadata.name.unwrap();
            self.known.lock().insert(name.clone());
            self.events.lock().push(format!("add {}", name));
            Ok(())
        }

        async fn on_update(&self, _old: ConfigMap, new: ConfigMap) -> Result<()> {
            self.events
                .lock()
                .push(format!("update {}", new.metadata.name.unwrap()));
            Ok(())
        }

        async fn on_delete(&self, obj: ConfigMap) -> Result<()> {
            let name = obj.metadata.name.unwrap();
            self.known.lock().remove(&name);
            self.events.lock().push(format!("delete {}", name));
            Ok(())
        }

        fn unchanged(&self, old: &ConfigMap, new: &ConfigMap) -> bool {
            old.data == new.data
        }

        fn missing(&self, snapshot: &VersionedMap<ConfigMap>) -> VersionedMap<ConfigMap> {
            let known = self.known.lock();
            let mut missing = VersionedMap::new();
            for (uid, obj) in snapshot.iter() {
                let name = obj.data.metadata.name.as_deref().unwrap();
                if !known.contains(name) {
                    missing.add(uid.clone(), obj.clone());
                }
            }
            missing
        }
    }

    struct Harness {
        handler: Arc<Recorder>,
        state: Arc<Mutex<FakeState>>,
        synced: watch::Receiver<bool>,
        _signal: drain::Signal,
    }

    fn spawn_controller(objects: Vec<ConfigMap>, page_size: usize, resync: Duration) -> Harness {
        let (client, state) = FakeClient::new(objects, page_size);
        let handler = Arc::new(Recorder::default());
        let mut prom = Registry::default();
        let (controller, synced) = Controller::new(
            "ConfigMap",
            client,
            handler.clone(),
            Store::new(),
            resync,
            WatchMetrics::register(&mut prom),
            Arc::new(ErrorSink::new()),
        );
        let (signal, shutdown) = drain::channel();
        tokio::spawn(controller.run(shutdown));
        Harness {
            handler,
            state,
            synced,
            _signal: signal,
        }
    }

    async fn synced(harness: &mut Harness) {
        harness
            .synced
            .wait_for(|synced| *synced)
            .await
            .expect("controller exited before syncing");
    }

    fn send(harness: &Harness, event: WatchEvent<ConfigMap>) {
        let state = harness.state.lock();
        state
            .watch_tx
            .as_ref()
            .expect("watch not established")
            .unbounded_send(Ok(event))
            .expect("watch stream closed");
    }

    async fn settle() {
        // Lets the controller drain its channels; timers auto-advance under
        // paused time.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn initial_list_paginates_and_signals_sync() {
        let objects = vec![
            mk_obj("a", "1", "x"),
            mk_obj("b", "2", "x"),
            mk_obj("c", "3", "x"),
        ];
        let mut harness = spawn_controller(objects, 2, Duration::from_secs(3600));
        synced(&mut harness).await;

        assert_eq!(
            harness.handler.events(),
            vec!["add a", "add b", "add c"],
            "every listed object is delivered as an add"
        );
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn unchanged_updates_are_dropped() {
        let mut harness =
            spawn_controller(vec![mk_obj("a", "1", "x")], 10, Duration::from_secs(3600));
        synced(&mut harness).await;
        settle().await;

        send(&harness, WatchEvent::Modified(mk_obj("a", "2", "x")));
        settle().await;
        assert_eq!(harness.handler.events(), vec!["add a"]);

        send(&harness, WatchEvent::Modified(mk_obj("a", "3", "y")));
        settle().await;
        assert_eq!(harness.handler.events(), vec!["add a", "update a"]);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn deletes_are_delivered_in_order() {
        let mut harness = spawn_controller(vec![], 10, Duration::from_secs(3600));
        synced(&mut harness).await;
        settle().await;

        send(&harness, WatchEvent::Added(mk_obj("a", "1", "x")));
        send(&harness, WatchEvent::Deleted(mk_obj("a", "2", "x")));
        settle().await;
        assert_eq!(harness.handler.events(), vec!["add a", "delete a"]);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn resync_replays_missing_objects() {
        let resync = Duration::from_secs(60);
        let mut harness = spawn_controller(vec![mk_obj("a", "1", "x")], 10, resync);
        synced(&mut harness).await;
        settle().await;

        // Simulate a handler failure that lost the object from local state.
        harness.handler.forget("a");

        time::sleep(resync + Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(harness.handler.events(), vec!["add a", "add a"]);
        assert!(harness.state.lock().list_calls >= 2, "resync re-lists");

        // With state intact, the next resync re-adds nothing.
        time::sleep(resync + Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(harness.handler.events(), vec!["add a", "add a"]);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn watch_failures_reestablish_the_stream() {
        let mut harness = spawn_controller(vec![], 10, Duration::from_secs(3600));
        synced(&mut harness).await;
        settle().await;
        assert_eq!(harness.state.lock().watch_calls, 1);

        // Drop the stream; the controller re-watches after a pause.
        harness.state.lock().watch_tx = None;
        time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert!(harness.state.lock().watch_calls >= 2);
    }
}
