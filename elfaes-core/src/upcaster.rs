//! Per-event-name, per-schema-version transformation chain to the current
//! schema (§4.5). Applied by the [`facade`][crate::facade] on every read.

use std::collections::HashMap;
use std::sync::Arc;

use crate::codec::EventRecord;

/// A single transform step: takes one event at `from_version` and returns
/// zero, one, or many events at `to_version` (§4.5 "a transform returning
/// multiple events is spliced into the sequence in place").
pub type UpcastFn = Arc<dyn Fn(EventRecord) -> Vec<EventRecord> + Send + Sync>;

#[derive(Clone)]
struct Transform {
    to_version: String,
    apply: UpcastFn,
}

/// Maps `(event name, from version)` to the transform that advances it
/// (§4.5). Supports a one-way *freeze* transition: after [`Upcasters::freeze`]
/// no more registrations are accepted.
#[derive(Clone, Default)]
pub struct Upcasters {
    transforms: HashMap<(String, String), Transform>,
    frozen: bool,
}

/// Error returned when a registration is attempted after [`Upcasters::freeze`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("upcaster registry is frozen; no further registrations are accepted")]
pub struct RegistryFrozen;

impl Upcasters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a transform from `(event_name, from_version)` to
    /// `to_version`. Registration order does not matter: lookups are keyed
    /// by `(name, version)`, not position.
    pub fn register(
        &mut self,
        event_name: impl Into<String>,
        from_version: impl Into<String>,
        to_version: impl Into<String>,
        apply: impl Fn(EventRecord) -> Vec<EventRecord> + Send + Sync + 'static,
    ) -> Result<(), RegistryFrozen> {
        if self.frozen {
            return Err(RegistryFrozen);
        }
        self.transforms.insert(
            (event_name.into(), from_version.into()),
            Transform {
                to_version: to_version.into(),
                apply: Arc::new(apply),
            },
        );
        Ok(())
    }

    /// Freezes the registry: no more registrations are accepted, and lookups
    /// use the same immutable map from here on (§4.5).
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Applies every eligible transform to `events` in place, repeating per
    /// event until no transform applies to its current `(name, version)`
    /// (§4.5). A transform that expands into N events re-checks each of the
    /// N outputs before moving to the next input event.
    #[must_use]
    pub fn apply_all(&self, events: Vec<EventRecord>) -> Vec<EventRecord> {
        let mut out = Vec::with_capacity(events.len());
        for event in events {
            out.extend(self.apply_one(event));
        }
        out
    }

    fn apply_one(&self, mut event: EventRecord) -> Vec<EventRecord> {
        // Bounded by the number of registered transforms: a well-formed
        // registry cannot cycle back to a version it has already produced.
        let max_hops = self.transforms.len() + 1;

        for _ in 0..max_hops {
            let key = (event.event_type.clone(), event.schema_version.clone());
            let Some(transform) = self.transforms.get(&key) else {
                return vec![event];
            };

            let produced = (transform.apply)(event);
            if produced.len() != 1 {
                // 1->N expansion: recurse into each output independently so
                // every spliced event is itself upcast to completion.
                return produced
                    .into_iter()
                    .flat_map(|e| self.apply_one(e))
                    .collect();
            }

            event = produced.into_iter().next().expect("checked len == 1 above");
            if event.schema_version == transform.to_version {
                continue;
            }
        }

        vec![event]
    }
}
