//! Memoized execution of expensive, deterministic steps.
//!
//! A [`Step`] turns a serializable input into a serializable output. [`execute`]
//! fingerprints the input's canonical encoding and consults the [`CacheStore`] held by
//! the [`StepContext`]: a stored entry is returned without running the step again, which
//! makes every step built on this module replayable and skip-on-repeat across process
//! restarts (with a durable store).
//!
//! A cache hit skips the step body entirely, including any side effects it would have
//! had. Callers that need notifications for every attempt must emit them themselves
//! after `execute` returns; [`Executed::cache_hit`] tells them which case occurred.
//!
//! Steps compose: a step receives the context it runs under and can execute child steps
//! with [`StepContext::child`], so nested results are cached under the parent's scope and
//! resuming a parent replays its children from the same store.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};

use crate::core::fingerprint::fingerprint;
use crate::io::cache::{CacheEntry, CacheKey, CacheStore, EntryMetadata, MemoryCache};

/// Boxed future returned by async collaborator traits.
///
/// Type alias to keep trait signatures and implementations readable.
pub type StepFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// An expensive transform whose output depends only on its input.
pub trait Step: Send + Sync {
    type Input: Serialize + Send + Sync;
    type Output: Serialize + DeserializeOwned + Send;

    /// Stable name used as the last segment of the cache namespace.
    fn name(&self) -> &str;

    fn run<'a>(&'a self, input: &'a Self::Input, ctx: &'a StepContext)
    -> StepFuture<'a, Self::Output>;

    /// Whether a successful output may be stored. Outputs that reflect a transient
    /// condition (a timeout, say) return false so a later run tries again.
    fn should_cache(&self, _output: &Self::Output) -> bool {
        true
    }
}

/// Persistence context threaded from parent steps to their children.
#[derive(Clone)]
pub struct StepContext {
    store: Arc<dyn CacheStore>,
    scope: Vec<String>,
}

impl StepContext {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            scope: Vec::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCache::new()))
    }

    /// Context for child steps nested under `name`.
    pub fn child(&self, name: &str) -> Self {
        let mut scope = self.scope.clone();
        scope.push(name.to_string());
        Self {
            store: Arc::clone(&self.store),
            scope,
        }
    }

    pub fn scope(&self) -> &[String] {
        &self.scope
    }

    fn key_for(&self, step: &str, fingerprint: String) -> CacheKey {
        let mut segments = self.scope.clone();
        segments.push(step.to_string());
        CacheKey {
            namespace: segments.join("/"),
            fingerprint,
        }
    }
}

/// Output of [`execute`] plus where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Executed<T> {
    pub output: T,
    pub cache_hit: bool,
    pub fingerprint: String,
}

/// Run `step` on `input`, or return the stored output for an identical input.
///
/// Failed runs, and outputs the step declines to cache, are not stored, so a retry with
/// the same input runs the step again.
#[instrument(skip_all, fields(step = step.name()))]
pub async fn execute<S: Step>(
    step: &S,
    input: &S::Input,
    ctx: &StepContext,
) -> Result<Executed<S::Output>> {
    let fingerprint = fingerprint(input)?;
    let key = ctx.key_for(step.name(), fingerprint.clone());

    if let Some(entry) = ctx.store.get(&key)? {
        debug!(namespace = %key.namespace, %fingerprint, "cache hit");
        let output = serde_json::from_value(entry.output)
            .with_context(|| format!("decode cached output for {}", key.namespace))?;
        return Ok(Executed {
            output,
            cache_hit: true,
            fingerprint,
        });
    }

    debug!(namespace = %key.namespace, %fingerprint, "cache miss, running step");
    let started = Instant::now();
    let output = step.run(input, ctx).await?;
    if !step.should_cache(&output) {
        debug!(namespace = %key.namespace, "output not cacheable, skipping store");
        return Ok(Executed {
            output,
            cache_hit: false,
            fingerprint,
        });
    }
    let entry = CacheEntry {
        output: serde_json::to_value(&output)
            .with_context(|| format!("encode output for {}", key.namespace))?,
        metadata: EntryMetadata {
            namespace: key.namespace.clone(),
            fingerprint: fingerprint.clone(),
            created_at: chrono::Utc::now().to_rfc3339(),
            duration_ms: started.elapsed().as_millis() as u64,
        },
    };
    ctx.store.put(&key, &entry)?;

    Ok(Executed {
        output,
        cache_hit: false,
        fingerprint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::io::cache::FileCache;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doubled {
        value: u64,
    }

    #[derive(Default)]
    struct Double {
        calls: AtomicU32,
    }

    impl Step for Double {
        type Input = u64;
        type Output = Doubled;

        fn name(&self) -> &str {
            "double"
        }

        fn run<'a>(&'a self, input: &'a u64, _ctx: &'a StepContext) -> StepFuture<'a, Doubled> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(Doubled { value: input * 2 })
            })
        }
    }

    /// Parent step that delegates to a child step under its own scope.
    struct Quadruple {
        inner: Double,
    }

    impl Step for Quadruple {
        type Input = u64;
        type Output = Doubled;

        fn name(&self) -> &str {
            "quadruple"
        }

        fn run<'a>(&'a self, input: &'a u64, ctx: &'a StepContext) -> StepFuture<'a, Doubled> {
            Box::pin(async move {
                let child = ctx.child("quadruple");
                let once = execute(&self.inner, input, &child).await?;
                let twice = execute(&self.inner, &once.output.value, &child).await?;
                Ok(twice.output)
            })
        }
    }

    struct Failing {
        calls: AtomicU32,
    }

    impl Step for Failing {
        type Input = String;
        type Output = String;

        fn name(&self) -> &str {
            "failing"
        }

        fn run<'a>(&'a self, _input: &'a String, _ctx: &'a StepContext) -> StepFuture<'a, String> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Err(anyhow!("boom"))
            })
        }
    }

    /// Doubles, but only caches results for even inputs.
    #[derive(Default)]
    struct EvenOnly {
        inner: Double,
    }

    impl Step for EvenOnly {
        type Input = u64;
        type Output = Doubled;

        fn name(&self) -> &str {
            "even_only"
        }

        fn run<'a>(&'a self, input: &'a u64, ctx: &'a StepContext) -> StepFuture<'a, Doubled> {
            self.inner.run(input, ctx)
        }

        fn should_cache(&self, output: &Doubled) -> bool {
            output.value % 4 == 0
        }
    }

    #[tokio::test]
    async fn declined_outputs_are_not_stored() {
        let step = EvenOnly::default();
        let ctx = StepContext::in_memory();

        for _ in 0..2 {
            let run = execute(&step, &1, &ctx).await.expect("odd");
            assert!(!run.cache_hit);
            assert_eq!(run.output.value, 2);
        }
        execute(&step, &2, &ctx).await.expect("even");
        let replayed = execute(&step, &2, &ctx).await.expect("even again");

        assert!(replayed.cache_hit);
        assert_eq!(step.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn identical_input_runs_once() {
        let step = Double::default();
        let ctx = StepContext::in_memory();

        let first = execute(&step, &21, &ctx).await.expect("first");
        let second = execute(&step, &21, &ctx).await.expect("second");

        assert_eq!(step.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.output, second.output);
        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(first.fingerprint, second.fingerprint);
    }

    #[tokio::test]
    async fn scopes_isolate_entries() {
        let step = Double::default();
        let ctx = StepContext::in_memory();

        execute(&step, &1, &ctx.child("a")).await.expect("a");
        execute(&step, &1, &ctx.child("b")).await.expect("b");
        assert_eq!(step.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn nested_steps_replay_from_durable_store() {
        let temp = tempfile::tempdir().expect("tempdir");
        let quadruple = Quadruple {
            inner: Double::default(),
        };
        let ctx = StepContext::new(Arc::new(FileCache::new(temp.path())));
        let out = execute(&quadruple, &3, &ctx).await.expect("run");
        assert_eq!(out.output.value, 12);
        assert_eq!(quadruple.inner.calls.load(Ordering::SeqCst), 2);

        // A fresh process with the same store replays without running anything.
        let resumed = Quadruple {
            inner: Double::default(),
        };
        let ctx = StepContext::new(Arc::new(FileCache::new(temp.path())));
        let replay = execute(&resumed, &3, &ctx).await.expect("replay");
        assert!(replay.cache_hit);
        assert_eq!(replay.output.value, 12);
        assert_eq!(resumed.inner.calls.load(Ordering::SeqCst), 0);

        // The children were cached under the parent's scope as well.
        let child_ctx = ctx.child("quadruple");
        let child = execute(&resumed.inner, &6, &child_ctx).await.expect("child");
        assert!(child.cache_hit);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let step = Failing {
            calls: AtomicU32::new(0),
        };
        let ctx = StepContext::in_memory();
        let input = "x".to_string();

        assert!(execute(&step, &input, &ctx).await.is_err());
        assert!(execute(&step, &input, &ctx).await.is_err());
        assert_eq!(step.calls.load(Ordering::SeqCst), 2);
    }
}
