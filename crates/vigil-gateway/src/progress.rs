//! ---
//! vigil_section: "04-client-gateway"
//! vigil_subsection: "module"
//! vigil_type: "source"
//! vigil_scope: "code"
//! vigil_description: "Client messaging gateway over a publish/subscribe broker."
//! vigil_version: "v0.1.0"
//! vigil_owner: "tbd"
//! ---
//! Reply stream classification for long-running requests.
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::debug;
use vigil_logging::{gw_warn, LogContext};
use vigil_msg::{classify_reply, ReplyFrame};

use crate::error::{GatewayError, Result};
use crate::listener::{guarded, ListenerKind, RequestReportListener};
use crate::metrics::GatewayMetrics;
use crate::request::PendingRequest;

const REPLY_KIND: &str = "reply";

/// Consumes a reply stream until its terminal message or the deadline.
pub struct ProgressStreamDecoder {
    listener: Option<Arc<dyn RequestReportListener>>,
    metrics: Option<GatewayMetrics>,
}

impl ProgressStreamDecoder {
    /// Create a decoder. Without a listener progress reports are skipped.
    pub fn new(
        listener: Option<Arc<dyn RequestReportListener>>,
        metrics: Option<GatewayMetrics>,
    ) -> Self {
        Self { listener, metrics }
    }

    /// Drive `pending` to completion.
    ///
    /// Progress reports go to the listener and the wait continues against
    /// the original deadline. An error report fails the call with the
    /// server text. Undecodable messages are skipped and counted.
    pub async fn drive<T: DeserializeOwned>(&self, pending: &mut PendingRequest) -> Result<Vec<T>> {
        while let Some(payload) = pending.next_reply().await {
            let frame = match classify_reply(&payload) {
                Ok(frame) => frame,
                Err(err) => {
                    self.undecodable(pending, &err.to_string());
                    continue;
                }
            };

            match frame {
                ReplyFrame::Progress(report) => {
                    debug!(
                        destination = pending.destination(),
                        current = report.current_operation,
                        total = report.total_operations,
                        "progress report received"
                    );
                    if let Some(listener) = &self.listener {
                        let ctx = LogContext::new().with_destination(pending.destination());
                        guarded(ListenerKind::Report, &ctx, self.metrics.as_ref(), || {
                            listener.on_progress(&report)
                        });
                    }
                }
                ReplyFrame::Error(report) => {
                    if let Some(listener) = &self.listener {
                        let ctx = LogContext::new().with_destination(pending.destination());
                        guarded(ListenerKind::Report, &ctx, self.metrics.as_ref(), || {
                            listener.on_error(&report)
                        });
                    }
                    pending.resolve();
                    return Err(GatewayError::Application {
                        message: report.error_message,
                    });
                }
                result @ ReplyFrame::Result(_) => match result.into_results::<T>() {
                    Ok(results) => {
                        pending.resolve();
                        return Ok(results);
                    }
                    Err(err) => self.undecodable(pending, &err.to_string()),
                },
            }
        }
        Err(pending.timeout_error())
    }

    fn undecodable(&self, pending: &mut PendingRequest, reason: &str) {
        let ctx = LogContext::new().with_destination(pending.destination());
        gw_warn!(context = ctx, "skipping undecodable reply: {}", reason);
        if let Some(metrics) = &self.metrics {
            metrics.inc_decode_failure(REPLY_KIND);
        }
        pending.note_undecodable();
    }
}
