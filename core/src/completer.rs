//! Per-Resource background gap-fill task.
//!
//! Exactly one completer task runs per resource at a time (enforced by
//! `Manager::start_background_by_id`'s `completers` map). It repeatedly
//! looks up the first remaining gap, fetches it in `CHUNK`-sized pieces
//! through `Manager::fetch_into_cache` (the same tee-to-file code path the
//! hybrid loop uses, with no live reader attached), and stops cooperatively
//! between chunks rather than polling.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::manager::{Manager, CHUNK};

/// Runs until the resource is complete (and promoted), the cancellation
/// token fires, or a fetch fails — failures are logged and end the task
/// without retrying; the next live request or an explicit `resume_all`
/// restarts it.
#[instrument(skip(manager, cancel), fields(id = %id))]
pub async fn run(manager: Arc<Manager>, id: String, cancel: CancellationToken) {
    debug!("completer started");

    loop {
        if cancel.is_cancelled() {
            debug!("completer cancelled");
            break;
        }

        let gap = match manager.next_gap(&id, 0).await {
            Ok(Some(gap)) => gap,
            Ok(None) => {
                match manager.maybe_promote_if_complete(&id).await {
                    Ok(true) => info!("completer promoted finished resource"),
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "completer failed to promote finished resource"),
                }
                break;
            }
            Err(e) => {
                warn!(error = %e, "completer failed to inspect cached set, stopping");
                break;
            }
        };

        let (gap_start, gap_end) = gap;
        let mut pos = gap_start;
        let mut failed = false;
        while pos <= gap_end {
            if cancel.is_cancelled() {
                debug!("completer cancelled mid-gap");
                manager.completer_finished(&id);
                return;
            }

            let win_end = (pos + CHUNK - 1).min(gap_end);
            if let Err(e) = manager.fetch_into_cache(&id, pos, win_end, (pos, win_end), None).await {
                warn!(error = %e, start = pos, end = win_end, "completer fetch failed, stopping");
                failed = true;
                break;
            }
            pos = win_end + 1;
        }

        if failed {
            break;
        }
    }

    manager.completer_finished(&id);
}
