use std::sync::Arc;

use tokio::time::{interval, sleep, timeout, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::settings::LiveFeedSettings;

use super::controller::AnalyzerController;
use super::{AnalysisError, ImageSource, SensorSample};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

pub(crate) struct LiveLoopContext {
    pub(crate) controller: AnalyzerController,
    pub(crate) image_source: Arc<dyn ImageSource>,
    pub(crate) user_id: String,
    pub(crate) epoch: u64,
    pub(crate) settings: LiveFeedSettings,
}

/// Recurring capture-analyze loop for live mode. A failed cycle leaves its
/// error on display but never stops the ticker; the next tick replaces it.
pub(crate) async fn live_feed_loop(ctx: LiveLoopContext, cancel_token: CancellationToken) {
    // Simulated device handshake.
    tokio::select! {
        _ = sleep(Duration::from_millis(ctx.settings.connect_delay_ms)) => {}
        _ = cancel_token.cancelled() => return,
    }

    ctx.controller.mark_connected(ctx.epoch).await;

    let mut ticker = interval(Duration::from_secs(ctx.settings.capture_interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // The first tick fires immediately, giving one cycle right after the
    // handshake; later ticks follow the configured interval.
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_cycle(&ctx).await;
            }
            _ = cancel_token.cancelled() => {
                log_info!("live feed loop shutting down");
                break;
            }
        }
    }
}

/// One cycle: fresh sensor sample, capture, then an analysis that runs
/// independently of the ticker. A capture from a new tick proceeds even if
/// an earlier analysis is still in flight; the display reflects whichever
/// analysis completes last.
async fn run_cycle(ctx: &LiveLoopContext) {
    let sample = SensorSample::generate(&mut rand::thread_rng());

    let capture_timeout = Duration::from_secs(ctx.settings.capture_timeout_secs);
    let captured = match timeout(capture_timeout, ctx.image_source.acquire_from_live_feed()).await
    {
        Ok(Ok(captured)) => captured,
        Ok(Err(err)) => {
            log_warn!("live capture failed: {err}");
            ctx.controller.apply_cycle_error(ctx.epoch, err).await;
            return;
        }
        Err(_) => {
            log_warn!(
                "live capture timeout (> {}s)",
                ctx.settings.capture_timeout_secs
            );
            ctx.controller
                .apply_cycle_error(
                    ctx.epoch,
                    AnalysisError::Capture("capture timed out".into()),
                )
                .await;
            return;
        }
    };

    if !ctx
        .controller
        .apply_live_capture(ctx.epoch, sample, captured.display_ref.clone())
        .await
    {
        return;
    }

    ctx.controller.spawn_analysis(
        ctx.epoch,
        ctx.user_id.clone(),
        captured.bytes,
        captured.display_ref,
    );
}
