use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::runtime::AppHandle;
use crate::types::BackfillProgress;

pub(crate) const BACKFILL_PROGRESS_EVENT: &str = "backfill-progress";
pub(crate) const PROGRESS_EMIT_INTERVAL_MS: i64 = 120;

pub(crate) fn now_ms() -> i64 {
    epoch_ms(SystemTime::now())
}

pub(crate) fn epoch_ms(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|duration| i64::try_from(duration.as_millis()).ok())
        .unwrap_or(0)
}

pub(crate) fn path_display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub(crate) fn emit_backfill_progress(
    app: &AppHandle,
    started_at: i64,
    progress: &BackfillProgress,
    last_emitted_ms: &mut i64,
    force: bool,
) {
    let now = now_ms();
    if !force && now - *last_emitted_ms < PROGRESS_EMIT_INTERVAL_MS {
        return;
    }

    let mut payload = progress.clone();
    payload.elapsed_ms = now - started_at;
    if let Err(error) = app.emit(BACKFILL_PROGRESS_EVENT, payload) {
        debug!(%error, "could not emit backfill progress");
    }
    *last_emitted_ms = now;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn epoch_ms_counts_from_unix_epoch() {
        let time = UNIX_EPOCH + Duration::from_millis(1_500);
        assert_eq!(epoch_ms(time), 1_500);
    }

    #[test]
    fn times_before_epoch_clamp_to_zero() {
        let time = UNIX_EPOCH - Duration::from_secs(5);
        assert_eq!(epoch_ms(time), 0);
    }
}
