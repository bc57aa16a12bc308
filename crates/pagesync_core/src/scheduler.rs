use std::future::Future;
use std::num::NonZeroUsize;

use futures::future::try_join_all;
use tracing::debug;

/// Split `items` into consecutive groups of at most `size`, keeping order.
pub fn partition<T>(items: Vec<T>, size: NonZeroUsize) -> Vec<Vec<T>> {
    let size = size.get();
    let mut groups = Vec::with_capacity(items.len().div_ceil(size));
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        groups.push(items.by_ref().take(size).collect());
    }
    groups
}

/// Run `op` over `items` group by group.
///
/// Members of a group run concurrently; the next group starts only after
/// every member of the current one finished. The first error stops the run
/// and later groups are never started.
pub async fn run_in_batches<T, R, E, F, Fut>(
    items: Vec<T>,
    size: NonZeroUsize,
    op: F,
) -> Result<Vec<R>, E>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let groups = partition(items, size);
    let total = groups.len();
    let mut results = Vec::new();
    for (index, group) in groups.into_iter().enumerate() {
        debug!(batch = index + 1, total, members = group.len(), "starting batch");
        results.extend(try_join_all(group.into_iter().map(&op)).await?);
    }
    Ok(results)
}
