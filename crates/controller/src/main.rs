mod adc;
mod arbiter;
mod clock;
mod config;
mod controller;
mod hw;
mod mqtt;
mod remote;
mod sampler;
mod schedule;
#[cfg(not(feature = "gpio"))]
mod sim;

#[cfg(not(any(feature = "gpio", feature = "sim")))]
compile_error!("build with either the `sim` (default) or the `gpio` feature");
mod state;
mod web;

use anyhow::{bail, Context, Result};
use rumqttc::{AsyncClient, MqttOptions, QoS};
use std::{env, time::Duration};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use clock::{Clock, SystemClock};
use controller::Controller;
use hw::{Actuator, Board};
use mqtt::{LinkEvent, Outbound};
use remote::{HttpDeleter, RemoteDelete};

/// Why the tick loop stopped.
enum Exit {
    Interrupted,
    LinkLost(u32),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    let clock = SystemClock::new(cfg.clock.utc_offset_minutes)?;

    // ── Hardware ────────────────────────────────────────────────────
    let mut board = Board::new(&cfg.hardware).context("failed to initialise hardware")?;
    board.set_on(false);

    let deleter = match &cfg.remote {
        Some(remote) => Some(HttpDeleter::new(remote)?),
        None => {
            info!("no [remote] section, consumed schedule keys will not be deleted");
            None
        }
    };

    let mut ctl = Controller::new(&cfg, Instant::now().into_std());
    let (status_tx, status_rx) = watch::channel(ctl.status());

    // ── Web server ──────────────────────────────────────────────────
    if cfg.web.enabled {
        let port = cfg.web.port;
        tokio::spawn(async move {
            if let Err(e) = web::serve(port, status_rx).await {
                error!(error = %format!("{e:#}"), "status api stopped");
            }
        });
    }

    // ── MQTT ────────────────────────────────────────────────────────
    let mut opts = MqttOptions::new(&cfg.mqtt.client_id, &cfg.mqtt.host, cfg.mqtt.port);
    opts.set_keep_alive(Duration::from_secs(cfg.mqtt.keep_alive_sec));
    if let Some(user) = &cfg.mqtt.username {
        opts.set_credentials(user, cfg.mqtt.password.as_deref().unwrap_or_default());
    }
    let (client, eventloop) = AsyncClient::new(opts, 64);
    let (link_tx, mut link_rx) = mpsc::channel(64);
    tokio::spawn(mqtt::run_link(eventloop, link_tx));
    info!(host = %cfg.mqtt.host, port = cfg.mqtt.port, "mqtt link started");

    // ── Tick loop ───────────────────────────────────────────────────
    let tick = Duration::from_millis(cfg.control.tick_ms);
    let max_failures = cfg.mqtt.max_reconnect_attempts;
    let mut failures: u32 = 0;
    let terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let shutdown = shutdown_signal(terminate);
    tokio::pin!(shutdown);

    let exit = 'run: loop {
        let started = Instant::now();

        for _ in 0..cfg.control.max_messages_per_tick {
            let Ok(event) = link_rx.try_recv() else {
                break;
            };
            match event {
                LinkEvent::Connected => {
                    failures = 0;
                    info!("mqtt connected");
                    ctl.link_up();
                    // Clean sessions drop subscriptions, so renew on every ConnAck.
                    for topic in ctl.topics().subscriptions() {
                        if let Err(e) = client.try_subscribe(topic, QoS::AtLeastOnce) {
                            warn!(topic, error = %e, "subscribe failed");
                        }
                    }
                    publish_all(&client, ctl.announce());
                }
                LinkEvent::Disconnected(reason) => {
                    failures += 1;
                    ctl.link_down(&reason);
                    if failures > max_failures {
                        break 'run Exit::LinkLost(failures);
                    }
                }
                LinkEvent::Message { topic, payload } => {
                    debug!(%topic, bytes = payload.len(), "inbound message");
                    ctl.handle_message(&topic, &payload, &mut board);
                }
            }
        }

        let out = ctl.tick(&mut board, clock.now_minute(), started.into_std());
        publish_all(&client, out.publishes);

        for key in out.deletes {
            let Some(deleter) = &deleter else {
                debug!(%key, "no remote configured, skipping delete");
                continue;
            };
            match deleter.delete(&key).await {
                Ok(()) => info!(%key, "remote schedule record deleted"),
                Err(e) => {
                    error!(%key, error = %e, "remote delete failed");
                    ctl.record_error(format!("remote delete {key}: {e}"));
                }
            }
        }

        status_tx.send_replace(ctl.status());

        tokio::select! {
            sig = &mut shutdown => {
                info!(signal = sig, "stop requested");
                break 'run Exit::Interrupted;
            }
            _ = sleep(tick.saturating_sub(started.elapsed())) => {}
        }
    };

    // ── Shutdown ────────────────────────────────────────────────────
    info!("shutting down, forcing light off");
    let last = ctl.shutdown(&mut board);
    publish_all(&client, last);
    status_tx.send_replace(ctl.status());
    if let Err(e) = client.try_disconnect() {
        debug!(error = %e, "mqtt disconnect failed");
    }
    // The link task still has to flush the queued requests.
    sleep(Duration::from_millis(250)).await;

    match exit {
        Exit::Interrupted => Ok(()),
        Exit::LinkLost(n) => bail!("mqtt link lost after {n} consecutive failures"),
    }
}

/// Resolves on SIGINT (ctrl-c) or SIGTERM, whichever comes first.
async fn shutdown_signal(mut terminate: Signal) -> &'static str {
    tokio::select! {
        res = tokio::signal::ctrl_c() => match res {
            Ok(()) => "SIGINT",
            Err(e) => {
                warn!(error = %e, "ctrl-c handler unavailable");
                terminate.recv().await;
                "SIGTERM"
            }
        },
        _ = terminate.recv() => "SIGTERM",
    }
}

/// Queue publishes on the client without waiting for room. While the link
/// is down the request queue can fill up; those messages are dropped.
fn publish_all(client: &AsyncClient, messages: Vec<Outbound>) {
    for msg in messages {
        debug!(topic = %msg.topic, payload = %msg.payload, "publish");
        if let Err(e) = client.try_publish(&msg.topic, QoS::AtLeastOnce, false, msg.payload) {
            warn!(topic = %msg.topic, error = %e, "publish failed");
        }
    }
}
