//! C6 — `forEach` fan-out: run one task invocation per item in a resolved
//! collection, under a concurrency bound, preserving input order in the
//! output regardless of completion order.
//!
//! Loosely grounded on the teacher's `durableengine/tasks/for_loop.rs`
//! shape (inject `item`/`index` into a child context, then execute the
//! nested task), generalized from its sequential accumulation to bounded
//! concurrent fan-out via `tokio::sync::Semaphore`.

use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::context::{ForEachFrame, TemplateContext};
use crate::workflow::ForEachSpec;

/// Run `invoke` once per item in `items`, each against a child context with
/// a `forEach` frame bound to that item/index. When `spec.parallel` is
/// true, up to `spec.max_concurrency` (or `default_concurrency` if unset)
/// invocations run concurrently; otherwise items run one at a time.
///
/// Results are returned in the original item order.
pub async fn run<T, E, F, Fut>(
    spec: &ForEachSpec,
    items: &[serde_json::Value],
    base_ctx: &TemplateContext,
    default_concurrency: usize,
    invoke: F,
) -> Vec<std::result::Result<T, E>>
where
    F: Fn(TemplateContext, usize) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = std::result::Result<T, E>> + Send,
    T: Send,
    E: Send,
{
    let concurrency = if spec.parallel {
        if spec.max_concurrency == 0 {
            default_concurrency
        } else {
            spec.max_concurrency
        }
    } else {
        1
    };
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

    let futures = items.iter().enumerate().map(|(index, item)| {
        let semaphore = Arc::clone(&semaphore);
        let child_ctx = base_ctx.with_for_each_frame(ForEachFrame {
            item_var: spec.item_var.clone(),
            index_var: spec.index_var.clone(),
            current_item: item.clone(),
            index,
        });
        let invoke = &invoke;
        async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
            invoke(child_ctx, index).await
        }
    });

    join_all(futures).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn spec(parallel: bool, max_concurrency: usize) -> ForEachSpec {
        ForEachSpec {
            items: "{{input.items}}".to_string(),
            item_var: "item".to_string(),
            index_var: "index".to_string(),
            parallel,
            max_concurrency,
        }
    }

    #[tokio::test]
    async fn preserves_order_regardless_of_completion_order() {
        let base = TemplateContext::new(serde_json::json!({}));
        let items: Vec<serde_json::Value> = (0..5).map(serde_json::Value::from).collect();
        let results = run::<i64, (), _, _>(&spec(true, 5), &items, &base, 10, |ctx, index| async move {
            let delay = 5 - index;
            tokio::time::sleep(std::time::Duration::from_millis(delay as u64)).await;
            Ok(ctx.for_each().unwrap().index as i64)
        })
        .await;
        let values: Vec<i64> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn bounds_concurrency() {
        let base = TemplateContext::new(serde_json::json!({}));
        let items: Vec<serde_json::Value> = (0..6).map(serde_json::Value::from).collect();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_observed = Arc::new(AtomicUsize::new(0));

        let in_flight_ref = Arc::clone(&in_flight);
        let max_observed_ref = Arc::clone(&max_observed);
        let _results = run::<(), (), _, _>(&spec(true, 2), &items, &base, 10, move |_ctx, _index| {
            let in_flight = Arc::clone(&in_flight_ref);
            let max_observed = Arc::clone(&max_observed_ref);
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_observed.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert!(max_observed.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn sequential_when_not_parallel() {
        let base = TemplateContext::new(serde_json::json!({}));
        let items: Vec<serde_json::Value> = (0..3).map(serde_json::Value::from).collect();
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let order_ref = Arc::clone(&order);
        let _ = run::<(), (), _, _>(&spec(false, 0), &items, &base, 10, move |ctx, _index| {
            let order = Arc::clone(&order_ref);
            async move {
                order.lock().await.push(ctx.for_each().unwrap().index);
                Ok(())
            }
        })
        .await;
        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }
}
