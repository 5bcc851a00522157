//! Lazy keyspace enumeration over a cursor-based scan.

use futures::stream::{self, Stream, TryStreamExt};

use super::CountingStore;
use crate::error::{GatekeeperError, Result};

/// Keys requested per scan round trip.
pub const DEFAULT_SCAN_PAGE_SIZE: usize = 100;

enum ScanState {
    Start,
    At(u64),
    Done,
}

/// Stream every key matching `pattern`, one scan page at a time.
///
/// The stream ends once the store hands back cursor 0. A key may be yielded
/// more than once when the keyspace changes mid-scan; callers treat repeats as
/// idempotent re-processing. The first error ends the stream.
pub fn scan_keys<'a>(
    store: &'a dyn CountingStore,
    pattern: String,
    page_size: usize,
) -> impl Stream<Item = Result<String>> + Send + 'a {
    let pages = stream::unfold(ScanState::Start, move |state| {
        let pattern = pattern.clone();
        async move {
            let cursor = match state {
                ScanState::Start => 0,
                ScanState::At(cursor) => cursor,
                ScanState::Done => return None,
            };

            match store.scan(cursor, &pattern, page_size).await {
                Ok((next, keys)) => {
                    let next_state = if next == 0 {
                        ScanState::Done
                    } else {
                        ScanState::At(next)
                    };
                    Some((Ok(keys), next_state))
                }
                Err(e) => Some((Err(e), ScanState::Done)),
            }
        }
    });

    pages
        .map_ok(|keys| stream::iter(keys.into_iter().map(Ok::<String, GatekeeperError>)))
        .try_flatten()
}
