//! Playback statistics sampling.

use std::time::Instant;

use serde::Serialize;

/// Raw inbound-RTP figures reported by a consumer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundRtpReport {
    pub bytes_received: u64,
    pub packets_received: u64,
    pub packets_lost: i64,
    /// Seconds.
    pub jitter: Option<f64>,
    /// Seconds.
    pub jitter_buffer_delay: Option<f64>,
    pub audio_level: Option<f64>,
    pub codec_mime_type: Option<String>,
    /// Seconds, from the active candidate pair.
    pub round_trip_time: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub codec: String,
    pub bitrate_kbps: u64,
    pub jitter_ms: f64,
    pub packet_loss_percent: f64,
    pub rtt_ms: Option<f64>,
    pub jitter_buffer_delay_secs: f64,
    pub audio_level: Option<f64>,
}

/// Turns successive reports into snapshots. Bitrate needs the previous
/// sample, so the first snapshot after a reset always reports 0 kbps.
#[derive(Debug, Default)]
pub struct StatsTracker {
    previous: Option<(Instant, u64)>,
}

impl StatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }

    pub fn sample(&mut self, report: &InboundRtpReport, now: Instant) -> StatsSnapshot {
        let bitrate_kbps = match self.previous {
            Some((at, bytes)) => {
                let secs = now.saturating_duration_since(at).as_secs_f64();
                if secs > 0.0 {
                    let delta = report.bytes_received.saturating_sub(bytes) as f64;
                    (delta * 8.0 / secs / 1000.0).round() as u64
                } else {
                    0
                }
            }
            None => 0,
        };
        self.previous = Some((now, report.bytes_received));

        let lost = report.packets_lost.max(0) as f64;
        let total = lost + report.packets_received as f64;
        let packet_loss_percent = if total > 0.0 { lost / total * 100.0 } else { 0.0 };

        StatsSnapshot {
            codec: report
                .codec_mime_type
                .as_deref()
                .map(|mime| mime.strip_prefix("audio/").unwrap_or(mime).to_string())
                .unwrap_or_else(|| "N/A".to_string()),
            bitrate_kbps,
            jitter_ms: report.jitter.unwrap_or(0.0) * 1000.0,
            packet_loss_percent,
            rtt_ms: report.round_trip_time.map(|rtt| rtt * 1000.0),
            jitter_buffer_delay_secs: report.jitter_buffer_delay.unwrap_or(0.0),
            audio_level: report.audio_level,
        }
    }
}
