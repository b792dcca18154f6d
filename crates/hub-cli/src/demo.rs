//! Scripted session against the simulated player.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use playback_hub::sim::SimulatedConsumer;
use playback_hub::{ConsumerPort, PlaybackHub, PresentationSurface, SurfaceToken};
use playback_hub_types::{
    MediaRef, PlaybackSnapshot, PresentationDescriptor, RegistryStats, SyncUpdate,
};
use serde::Serialize;

/// Presentation surface that only logs what it would render.
pub struct LogSurface;

impl PresentationSurface for LogSurface {
    fn start(
        &self,
        token: &SurfaceToken,
        descriptor: &PresentationDescriptor,
    ) -> anyhow::Result<()> {
        tracing::info!(
            token = token.id(),
            title = %descriptor.title,
            playing = descriptor.playing,
            actions = descriptor.actions.len(),
            "surface started"
        );
        Ok(())
    }

    fn stop(&self, token: SurfaceToken) {
        tracing::info!(token = token.id(), "surface stopped");
    }

    fn update(&self, token: &SurfaceToken, descriptor: &PresentationDescriptor) {
        tracing::debug!(
            token = token.id(),
            title = %descriptor.title,
            playing = descriptor.playing,
            position_ms = descriptor.position_ms,
            "surface updated"
        );
    }
}

#[derive(Serialize)]
pub struct RequestReport {
    pub consumer: String,
    pub request: String,
    pub accepted: bool,
}

#[derive(Serialize)]
pub struct DemoReport {
    pub snapshot: PlaybackSnapshot,
    pub state: SyncUpdate,
    pub stats: RegistryStats,
    pub presenting: bool,
    pub requests: Vec<RequestReport>,
}

fn demo_track() -> MediaRef {
    MediaRef {
        album: Some("Field Recordings".to_string()),
        artwork_url: None,
        ..MediaRef::new("demo-track-1")
            .with_title("Harbour at Dawn")
            .with_artist("Simulated Ensemble")
            .with_duration_ms(245_000)
    }
}

/// Register `consumer_ids`, play a track and let every consumer issue a
/// volume request, then report what the hub ended up with.
pub fn run(hub: &PlaybackHub, consumer_ids: &[String]) -> Result<DemoReport> {
    let mut ports: Vec<(Arc<SimulatedConsumer>, ConsumerPort)> = Vec::new();
    for id in consumer_ids {
        let consumer = SimulatedConsumer::new(id.clone());
        let port = hub
            .register_consumer(consumer.clone())
            .with_context(|| format!("register consumer {id:?}"))?;
        ports.push((consumer, port));
    }

    let handle = hub.get_or_create().context("create playback resource")?;
    let proxy = handle
        .try_proxy()
        .context("playback resource released during demo")?;
    proxy.set_media(Some(demo_track()));
    proxy.play();
    proxy.seek_to(30_000);

    let mut requests = Vec::new();
    for (step, (consumer, port)) in ports.iter().enumerate() {
        let volume = 0.9 - step as f32 * 0.1;
        requests.push(RequestReport {
            consumer: port.consumer_id().to_string(),
            request: format!("volume {volume:.1}"),
            accepted: port.request_volume_change(volume),
        });
        tracing::debug!(
            consumer = %port.consumer_id(),
            notices = consumer.notices().len(),
            "consumer state"
        );
    }

    if let Some((_, port)) = ports.first() {
        std::thread::sleep(hub.config().sync_throttle + Duration::from_millis(20));
        requests.push(RequestReport {
            consumer: port.consumer_id().to_string(),
            request: "pause".to_string(),
            accepted: port.request_playback_change(false),
        });
    }

    let snapshot = proxy.try_snapshot().context("read player state")?;
    Ok(DemoReport {
        state: hub.broker().current_state(),
        stats: hub.stats(),
        presenting: hub.arbiter().is_some_and(|a| a.is_active()),
        snapshot,
        requests,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use playback_hub::sim::{SimulatedPlayer, SimulatedPlayerStats};
    use playback_hub::{EnvironmentFlag, HubConfig};

    fn hub(environment: Arc<EnvironmentFlag>) -> PlaybackHub {
        let config = HubConfig {
            sync_throttle: Duration::from_millis(200),
            call_timeout: Duration::from_secs(5),
            ready_timeout: Duration::from_secs(5),
            ..HubConfig::default()
        };
        PlaybackHub::builder(SimulatedPlayer::factory(SimulatedPlayerStats::shared()))
            .config(config)
            .surface(Arc::new(LogSurface))
            .environment(environment)
            .build()
            .unwrap()
    }

    #[test]
    fn demo_reports_throttled_requests() {
        let hub = hub(EnvironmentFlag::new());
        let ids = vec!["watch.face".to_string(), "dashboard".to_string()];
        let report = run(&hub, &ids).unwrap();

        assert_eq!(report.stats.connected, 2);
        assert!(report.presenting);
        let accepted: Vec<bool> = report.requests.iter().map(|r| r.accepted).collect();
        assert_eq!(accepted, vec![true, false, true]);
        assert!(!report.snapshot.play_when_ready);
        assert_eq!(report.snapshot.position_ms, 30_000);
        assert_eq!(report.snapshot.volume, 0.9);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["snapshot"]["media"]["id"], "demo-track-1");
    }

    #[test]
    fn headunit_suppresses_presentation() {
        let hub = hub(EnvironmentFlag::new());
        let report = run(&hub, &["auto.headunit-1".to_string()]).unwrap();
        assert!(!report.presenting);
    }

    #[test]
    fn takeover_environment_suppresses_presentation() {
        let environment = EnvironmentFlag::new();
        environment.set(true);
        let hub = hub(environment);
        let report = run(&hub, &["watch.face".to_string()]).unwrap();
        assert!(!report.presenting);
    }
}
