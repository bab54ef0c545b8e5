use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::utils::unix_now;

use super::processor::{ProcessOutcome, Processor};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info};

/// Periodic, unforced processing runs. The first run happens one period
/// after start.
pub async fn processing_loop(
    processor: Processor,
    period: Duration,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    log_info!("processing loop started (period {:?})", period);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match processor.run(false, unix_now()).await {
                    Ok(ProcessOutcome::Completed(report)) => {
                        log_debug!(
                            "processing run finished: {} processed, {} segments",
                            report.processed,
                            report.segments.len()
                        );
                    }
                    Ok(ProcessOutcome::Deferred { reason }) => {
                        log_debug!("processing run deferred: {reason:?}");
                    }
                    Err(err) => log_error!("processing run failed: {err:#}"),
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("processing loop shutting down");
                break;
            }
        }
    }
}
