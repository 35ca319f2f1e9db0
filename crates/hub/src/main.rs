mod calibration;
mod config;
mod db;
mod error;
mod manual;
mod model;
mod mqtt;
mod notice;
mod persist;
mod preset;
mod pump;
mod room;
mod sensor;
mod state;
mod steering;
mod supervisor;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{collections::HashMap, env, sync::Arc, time::Duration};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use db::Db;
use mqtt::{
    classify, notice_topic, parse_calibration, parse_growth, parse_mode, parse_operation,
    parse_sensors, Inbound, MqttPumpDriver,
};
use notice::{Notifier, RoomNotice};
use persist::{DbStore, StateStore};
use pump::{IrrigationExecutor, PumpArbitrator};
use room::RoomContext;
use sensor::SensorAggregator;
use state::{SharedState, SystemState};
use supervisor::{RoomCommand, RoomHandle};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:cropsteer.db?mode=rwc".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;
    let (store, writer) = DbStore::open(db.clone()).await?;
    let store: Arc<dyn StateStore> = Arc::new(store);

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    if cfg.rooms.is_empty() {
        warn!(path = %config_path, "no rooms configured");
    }

    // ── MQTT client ─────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("cropsteer-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 64);

    // ── Rooms ───────────────────────────────────────────────────────
    let sensors = Arc::new(SensorAggregator::new());
    let notifier = Notifier::new();
    let driver = Arc::new(MqttPumpDriver::spawn(client.clone()));
    let shared = SystemState::shared();

    let mut handles: HashMap<String, RoomHandle> = HashMap::new();
    let mut joins = Vec::new();
    let mut views = Vec::new();
    for entry in &cfg.rooms {
        sensors.set_growth(&entry.room_id, entry.growth());
        let arbitrator = Arc::new(PumpArbitrator::new(
            entry.room_id.clone(),
            driver.clone(),
            cfg.steering.cancel_grace(),
        ));
        let executor = IrrigationExecutor::new(
            entry.room_id.clone(),
            arbitrator.clone(),
            notifier.clone(),
            store.clone(),
        );
        let ctx = Arc::new(RoomContext {
            room_id: entry.room_id.clone(),
            devices: entry.pump_devices.clone(),
            inputs: sensors.clone(),
            arbitrator,
            executor,
            store: store.clone(),
            notifier: notifier.clone(),
            steering: cfg.steering.clone(),
            calibration: cfg.calibration.clone(),
            manual: entry.manual.clone(),
        });
        // Nothing should be running from a previous life.
        ctx.arbitrator.force_off(&ctx.devices);

        let (handle, join) = supervisor::spawn(ctx.clone());
        info!(room = %entry.room_id, name = %entry.name, pumps = ?entry.pump_devices, "room ready");
        views.push(web::RoomView {
            ctx,
            handle: handle.clone(),
        });
        handles.insert(entry.room_id.clone(), handle);
        joins.push(join);
    }
    shared
        .write()
        .await
        .record_system(format!("hub started with {} room(s)", handles.len()));

    // ── Notices ─────────────────────────────────────────────────────
    tokio::spawn(fan_out_notices(notifier.subscribe(), shared.clone(), client.clone()));

    // ── Web server ──────────────────────────────────────────────────
    let app = web::AppState {
        shared: shared.clone(),
        rooms: Arc::new(views),
        db,
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(app, web_port).await {
            error!("status api stopped: {e:#}");
        }
    });

    // ── MQTT loop ───────────────────────────────────────────────────
    loop {
        let event = tokio::select! {
            event = eventloop.poll() => event,
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        };
        match event {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                dispatch(&p.topic, &p.payload, &handles, &sensors, &shared).await;
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                // Clean sessions drop subscriptions on every reconnect.
                for topic in mqtt::SUBSCRIPTIONS {
                    if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                        error!(%topic, "subscribe failed: {e}");
                    }
                }
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }

    // ── Shutdown ────────────────────────────────────────────────────
    for handle in handles.values() {
        handle.shutdown();
    }
    for join in joins {
        let _ = join.await;
    }
    // Give the OFF commands a chance to leave before the process exits.
    let _ = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if eventloop.poll().await.is_err() {
                break;
            }
        }
    })
    .await;
    // The status API still holds the room contexts, so the writer never sees
    // its channel close; give queued writes a moment instead.
    drop(store);
    sleep(Duration::from_millis(500)).await;
    writer.abort();
    info!("hub stopped");
    Ok(())
}

/// Route one inbound publish to the aggregator or a room supervisor.
async fn dispatch(
    topic: &str,
    payload: &[u8],
    rooms: &HashMap<String, RoomHandle>,
    sensors: &SensorAggregator,
    shared: &SharedState,
) {
    let Some(inbound) = classify(topic) else {
        debug!(%topic, "unhandled topic");
        return;
    };

    let room = match inbound {
        Inbound::Mode(r)
        | Inbound::Calibration(r)
        | Inbound::Growth(r)
        | Inbound::Sensors(r)
        | Inbound::Operation { room: r, .. } => r,
    };
    let Some(handle) = rooms.get(room) else {
        debug!(room = %room, %topic, "message for unknown room");
        return;
    };

    let parsed: Result<(RoomCommand, String), String> = match inbound {
        Inbound::Sensors(_) => {
            match parse_sensors(payload) {
                Ok(snap) => sensors.apply_snapshot(room, snap),
                Err(msg) => warn!(room = %room, "{msg}"),
            }
            return;
        }
        Inbound::Growth(_) => {
            match parse_growth(payload) {
                Ok(growth) => {
                    info!(room = %room, stage = ?growth.stage, week = growth.week, "growth updated");
                    sensors.set_growth(room, growth);
                    shared
                        .write()
                        .await
                        .record_command(room, format!("growth {:?} week {}", growth.stage, growth.week));
                }
                Err(msg) => shared.write().await.record_error(format!("{topic}: {msg}")),
            }
            return;
        }
        Inbound::Mode(_) => parse_mode(payload).map(|mode| (RoomCommand::SetMode(mode), format!("mode -> {mode}"))),
        Inbound::Calibration(_) => parse_calibration(payload).map(|cmd| {
            let detail = format!("calibration {:?} for {}", cmd.action, cmd.phase);
            (RoomCommand::Calibration(cmd), detail)
        }),
        Inbound::Operation { kind, .. } => parse_operation(kind, payload).map(|(kind, req)| {
            let detail = format!("{kind} for {}s", req.duration_sec);
            (RoomCommand::RunOperation(kind, req), detail)
        }),
    };

    match parsed {
        Ok((cmd, detail)) => {
            info!(room = %room, %detail, "command received");
            if handle.send(cmd) {
                shared.write().await.record_command(room, detail);
            } else {
                warn!(room = %room, "room supervisor is gone");
            }
        }
        Err(msg) => {
            warn!(room = %room, %topic, "{msg}");
            shared.write().await.record_error(format!("{topic}: {msg}"));
        }
    }
}

/// Log, record and republish every notice as `notice/<room>`.
async fn fan_out_notices(mut rx: broadcast::Receiver<RoomNotice>, shared: SharedState, client: AsyncClient) {
    loop {
        match rx.recv().await {
            Ok(notice) => {
                info!(room = %notice.room, "{}", notice.summary());
                shared.write().await.record_notice(&notice);
                match serde_json::to_vec(&notice) {
                    Ok(json) => {
                        if let Err(e) = client
                            .publish(notice_topic(&notice.room), QoS::AtLeastOnce, false, json)
                            .await
                        {
                            warn!(room = %notice.room, "notice publish failed: {e}");
                        }
                    }
                    Err(e) => error!("notice serialization failed: {e}"),
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "notice fan-out lagging"),
            Err(RecvError::Closed) => break,
        }
    }
}
