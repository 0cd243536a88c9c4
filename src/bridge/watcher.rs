use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::compiler;
use super::registry::{BoundObject, ObjectId};
use super::value::Fingerprint;

/// Receiver of host-to-script notifications.
///
/// Called from watcher tasks on arbitrary threads; implementations must hand
/// the notification off without blocking.
pub trait BroadcastSink: Send + Sync {
    fn broadcast(&self, channel: &str, data: &JsonValue);
}

/// One running poll task for one watched property.
#[derive(Debug)]
pub struct WatchHandle {
    object_id: ObjectId,
    property: String,
    task: JoinHandle<()>,
}

impl WatchHandle {
    pub fn object_id(&self) -> &ObjectId {
        &self.object_id
    }

    pub fn property(&self) -> &str {
        &self.property
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

/// Spawns poll tasks for the watched properties of bound objects.
pub struct MutationWatcher {
    handle: Handle,
    interval: Duration,
    sink: Arc<dyn BroadcastSink>,
}

impl MutationWatcher {
    pub fn new(handle: Handle, interval: Duration, sink: Arc<dyn BroadcastSink>) -> Self {
        Self {
            handle,
            interval: interval.max(Duration::from_millis(1)),
            sink,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start one task per watched property of `bound`.
    ///
    /// The current value is sampled here, before the task starts, so only
    /// changes made after this call are broadcast.
    pub fn watch(&self, bound: &Arc<BoundObject>) -> Vec<WatchHandle> {
        let descriptor = bound.object().descriptor();
        descriptor
            .properties()
            .filter(|property| property.is_watched())
            .map(|property| {
                let name = property.name().to_string();
                let baseline = sample(bound, &name).map(|(_, fingerprint)| fingerprint);
                let task = self.handle.spawn(poll_property(
                    Arc::downgrade(bound),
                    name.clone(),
                    compiler::mutation_channel(bound.id(), &name),
                    baseline,
                    self.interval,
                    Arc::clone(&self.sink),
                ));
                tracing::debug!(
                    target: "watcher",
                    id = %bound.id(),
                    property = %name,
                    interval_ms = self.interval.as_millis() as u64,
                    "started mutation watcher"
                );
                WatchHandle {
                    object_id: bound.id().clone(),
                    property: name,
                    task,
                }
            })
            .collect()
    }
}

async fn poll_property(
    target: Weak<BoundObject>,
    property: String,
    channel: String,
    mut last: Option<Fingerprint>,
    interval: Duration,
    sink: Arc<dyn BroadcastSink>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // First tick happens immediately, skip it

    loop {
        ticker.tick().await;

        let Some(bound) = target.upgrade() else {
            break;
        };
        if !bound.is_live() {
            break;
        }

        let Some((value, current)) = sample(&bound, &property) else {
            continue;
        };
        drop(bound);

        if last == Some(current) {
            continue;
        }
        // A failed baseline sample establishes the baseline silently.
        let had_baseline = last.is_some();
        last = Some(current);
        if had_baseline {
            sink.broadcast(&channel, &value);
        }
    }

    tracing::debug!(target: "watcher", %channel, "mutation watcher stopped");
}

/// Sampling failures are swallowed; the caller retries on the next tick.
fn sample(bound: &BoundObject, property: &str) -> Option<(JsonValue, Fingerprint)> {
    let descriptor = bound.object().descriptor().property(property)?;
    let instance = bound.object().instance();
    match catch_unwind(AssertUnwindSafe(|| descriptor.sample(instance))) {
        Ok(Ok(value)) => {
            let fingerprint = Fingerprint::of(&value);
            Some((value, fingerprint))
        }
        Ok(Err(err)) => {
            tracing::trace!(target: "watcher", %property, error = %err, "sampling failed");
            None
        }
        Err(_) => {
            tracing::trace!(target: "watcher", %property, "sampling panicked");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{
        DescriptorBuilder, ExposedObject, ObjectRef, ObjectRegistry, ValueCell, ValueFlags,
    };
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Collect(Mutex<Vec<(String, JsonValue)>>);

    impl BroadcastSink for Collect {
        fn broadcast(&self, channel: &str, data: &JsonValue) {
            self.0.lock().push((channel.to_string(), data.clone()));
        }
    }

    struct Gauge {
        level: ValueCell<u8>,
        label: ValueCell<String>,
    }

    impl ExposedObject for Gauge {
        fn describe(desc: &mut DescriptorBuilder<Self>) {
            desc.value_with("level", |gauge| &gauge.level, ValueFlags::default().watched())
                .value("label", |gauge| &gauge.label);
        }
    }

    #[tokio::test]
    async fn watches_only_flagged_properties() {
        let registry = ObjectRegistry::new();
        let gauge = Arc::new(Gauge {
            level: ValueCell::new(1),
            label: ValueCell::new("tank".into()),
        });
        registry
            .register("Gauge", ObjectRef::new(Arc::clone(&gauge)))
            .unwrap();
        let bound = registry.lookup_path("Gauge").unwrap();

        let sink = Arc::new(Collect::default());
        let watcher = MutationWatcher::new(
            Handle::current(),
            Duration::ZERO,
            Arc::clone(&sink) as Arc<dyn BroadcastSink>,
        );
        assert_eq!(watcher.interval(), Duration::from_millis(1));

        let handles = watcher.watch(&bound);
        let watched: Vec<_> = handles.iter().map(|handle| handle.property()).collect();
        assert_eq!(watched, vec!["level"]);
        assert_eq!(handles[0].object_id(), bound.id());

        gauge.label.set("drum".into());
        gauge.level.set(2);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            *sink.0.lock(),
            vec![(compiler::mutation_channel(bound.id(), "level"), json!(2))]
        );

        handles[0].stop();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(handles[0].is_finished());
    }
}
