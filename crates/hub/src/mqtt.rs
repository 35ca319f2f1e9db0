use rumqttc::{AsyncClient, QoS};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::error;

use crate::error::{ControlError, ControlResult};
use crate::model::{IrrigationMode, OperationKind, Phase};
use crate::preset::GrowthInfo;
use crate::pump::PumpDriver;
use crate::sensor::SensorSnapshot;
use crate::supervisor::{CalibrationCommand, OperationRequest};

/// Topics the hub subscribes to.
pub const SUBSCRIPTIONS: [&str; 5] = [
    "rooms/+/mode",
    "rooms/+/calibration",
    "rooms/+/growth",
    "rooms/+/ops/+",
    "tele/+/sensors",
];

// ---------------------------------------------------------------------------
// Topic helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Inbound<'a> {
    Mode(&'a str),
    Calibration(&'a str),
    Growth(&'a str),
    Operation { room: &'a str, kind: &'a str },
    Sensors(&'a str),
}

/// Classify an incoming topic; `None` for anything the hub does not handle.
pub(crate) fn classify(topic: &str) -> Option<Inbound<'_>> {
    let parts: Vec<&str> = topic.split('/').collect();
    match parts[..] {
        ["rooms", room, "mode"] if !room.is_empty() => Some(Inbound::Mode(room)),
        ["rooms", room, "calibration"] if !room.is_empty() => Some(Inbound::Calibration(room)),
        ["rooms", room, "growth"] if !room.is_empty() => Some(Inbound::Growth(room)),
        ["rooms", room, "ops", kind] if !room.is_empty() => Some(Inbound::Operation { room, kind }),
        ["tele", room, "sensors"] if !room.is_empty() => Some(Inbound::Sensors(room)),
        _ => None,
    }
}

pub(crate) fn pump_topic(device: &str) -> String {
    format!("pump/{device}/set")
}

pub(crate) fn notice_topic(room: &str) -> String {
    format!("notice/{room}")
}

// ---------------------------------------------------------------------------
// Payload helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ModeObject {
    mode: String,
    #[serde(default)]
    phase: Option<Phase>,
}

/// Accepts a bare mode string (`automatic`, `manual:p2`), a JSON string, or
/// `{"mode":"manual","phase":"p2"}`.
pub(crate) fn parse_mode(payload: &[u8]) -> Result<IrrigationMode, String> {
    let text = String::from_utf8_lossy(payload);
    let text = text.trim();
    if text.starts_with('{') {
        let obj: ModeObject =
            serde_json::from_str(text).map_err(|e| format!("bad mode json: {e}"))?;
        return match obj.phase {
            Some(phase) if obj.mode.trim().eq_ignore_ascii_case("manual") => {
                Ok(IrrigationMode::Manual(phase))
            }
            _ => obj.mode.parse(),
        };
    }
    text.trim_matches('"').parse()
}

pub(crate) fn parse_calibration(payload: &[u8]) -> Result<CalibrationCommand, String> {
    serde_json::from_slice(payload).map_err(|e| format!("bad calibration command: {e}"))
}

pub(crate) fn parse_sensors(payload: &[u8]) -> Result<SensorSnapshot, String> {
    serde_json::from_slice(payload).map_err(|e| format!("bad sensor json: {e}"))
}

pub(crate) fn parse_growth(payload: &[u8]) -> Result<GrowthInfo, String> {
    serde_json::from_slice(payload).map_err(|e| format!("bad growth json: {e}"))
}

pub(crate) fn parse_operation(kind: &str, payload: &[u8]) -> Result<(OperationKind, OperationRequest), String> {
    let kind: OperationKind = kind.parse()?;
    let req: OperationRequest =
        serde_json::from_slice(payload).map_err(|e| format!("bad {kind} request: {e}"))?;
    if req.duration_sec == 0 {
        return Err(format!("{kind} request needs a positive duration_sec"));
    }
    Ok((kind, req))
}

// ---------------------------------------------------------------------------
// Pump driver
// ---------------------------------------------------------------------------

/// Publishes `ON`/`OFF` to `pump/<device>/set`.
///
/// Commands are queued without bound and forwarded in order by a task that
/// waits for room in the client's request channel, so a burst of notices
/// can delay an OFF but never drop it.
pub struct MqttPumpDriver {
    tx: mpsc::UnboundedSender<(String, bool)>,
}

impl MqttPumpDriver {
    /// Must be called inside the runtime; spawns the forwarding task.
    pub fn spawn(client: AsyncClient) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_pump_commands(rx, client));
        Self { tx }
    }
}

impl PumpDriver for MqttPumpDriver {
    fn set(&self, device: &str, on: bool) -> ControlResult<()> {
        self.tx
            .send((device.to_string(), on))
            .map_err(|_| ControlError::Pump {
                device: device.to_string(),
                reason: "pump command forwarder stopped".to_string(),
            })
    }
}

async fn forward_pump_commands(mut rx: mpsc::UnboundedReceiver<(String, bool)>, client: AsyncClient) {
    while let Some((device, on)) = rx.recv().await {
        let payload = if on { "ON" } else { "OFF" };
        // Only fails once the event loop is gone.
        if let Err(e) = client
            .publish(pump_topic(&device), QoS::AtLeastOnce, false, payload)
            .await
        {
            error!(device = %device, on, "pump command lost: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preset::GrowthStage;
    use crate::supervisor::CalibrationAction;
    use rumqttc::{MqttOptions, Request};

    // -- classify -----------------------------------------------------------

    #[test]
    fn classify_room_topics() {
        assert_eq!(classify("rooms/flower-1/mode"), Some(Inbound::Mode("flower-1")));
        assert_eq!(classify("rooms/r1/calibration"), Some(Inbound::Calibration("r1")));
        assert_eq!(classify("rooms/r1/growth"), Some(Inbound::Growth("r1")));
        assert_eq!(
            classify("rooms/r1/ops/retrieve"),
            Some(Inbound::Operation {
                room: "r1",
                kind: "retrieve"
            })
        );
        assert_eq!(classify("tele/r1/sensors"), Some(Inbound::Sensors("r1")));
    }

    #[test]
    fn classify_rejects_unknown_shapes() {
        assert_eq!(classify("rooms/r1/status"), None);
        assert_eq!(classify("rooms//mode"), None);
        assert_eq!(classify("tele/r1/reading"), None);
        assert_eq!(classify("rooms/r1/mode/extra"), None);
        assert_eq!(classify("pump/p1/set"), None);
        assert_eq!(classify(""), None);
    }

    #[test]
    fn outbound_topics() {
        assert_eq!(pump_topic("pump-a"), "pump/pump-a/set");
        assert_eq!(notice_topic("r1"), "notice/r1");
    }

    // -- parse_mode ---------------------------------------------------------

    #[test]
    fn parse_mode_plain_strings() {
        assert_eq!(parse_mode(b"automatic"), Ok(IrrigationMode::Automatic));
        assert_eq!(parse_mode(b"  Disabled \n"), Ok(IrrigationMode::Disabled));
        assert_eq!(
            parse_mode(b"manual:p2"),
            Ok(IrrigationMode::Manual(Phase::P2Maintenance))
        );
        assert_eq!(parse_mode(br#""config""#), Ok(IrrigationMode::Config));
    }

    #[test]
    fn parse_mode_json_object() {
        assert_eq!(
            parse_mode(br#"{"mode":"manual","phase":"p3"}"#),
            Ok(IrrigationMode::Manual(Phase::P3NightDryback))
        );
        assert_eq!(
            parse_mode(br#"{"mode":"automatic"}"#),
            Ok(IrrigationMode::Automatic)
        );
        assert!(parse_mode(br#"{"mode":"manual"}"#).is_err());
    }

    #[test]
    fn parse_mode_garbage() {
        assert!(parse_mode(b"turbo").is_err());
        assert!(parse_mode(b"").is_err());
        assert!(parse_mode(b"{not json").is_err());
    }

    // -- other payloads -----------------------------------------------------

    #[test]
    fn parse_calibration_command() {
        let cmd = parse_calibration(br#"{"action":"stop"}"#).unwrap();
        assert_eq!(cmd.action, CalibrationAction::Stop);
        assert!(parse_calibration(br#"{"action":"explode"}"#).is_err());
    }

    #[test]
    fn parse_sensor_snapshot() {
        let snap = parse_sensors(
            br#"{"vwc":{"s1":61.5,"s2":"60.1"},"ec":{"e1":3.1},"light":"on"}"#,
        )
        .unwrap();
        assert_eq!(snap.vwc.len(), 2);
        assert_eq!(snap.ec.len(), 1);
        assert!(snap.light.is_some());
        assert!(parse_sensors(b"[]").is_err());
    }

    #[test]
    fn parse_growth_payload() {
        let g = parse_growth(br#"{"stage":"generative","week":2}"#).unwrap();
        assert_eq!(g.stage, GrowthStage::Generative);
        assert_eq!(g.week, 2);
        assert!(parse_growth(br#"{"stage":"flowering"}"#).is_err());
    }

    #[test]
    fn parse_operation_request() {
        let (kind, req) =
            parse_operation("feed_nutrients", br#"{"devices":["p1"],"duration_sec":45}"#).unwrap();
        assert_eq!(kind, OperationKind::FeedNutrients);
        assert_eq!(req.devices, vec!["p1".to_string()]);
        assert_eq!(req.duration_sec, 45);

        let (_, req) = parse_operation("retrieve", br#"{"duration_sec":10}"#).unwrap();
        assert!(req.devices.is_empty());

        assert!(parse_operation("sprinkle", br#"{"duration_sec":10}"#).is_err());
        assert!(parse_operation("hydro", br#"{"duration_sec":0}"#).is_err());
    }

    // -- driver ---------------------------------------------------------------

    fn pump_payloads(eventloop: &mut rumqttc::EventLoop) -> Vec<(String, String)> {
        eventloop.clean();
        eventloop
            .pending
            .drain(..)
            .filter_map(|req| match req {
                Request::Publish(p) if p.topic.starts_with("pump/") => Some((
                    p.topic,
                    String::from_utf8_lossy(&p.payload).into_owned(),
                )),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn driver_forwards_commands_in_order() {
        let (client, mut eventloop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 10);
        let driver = MqttPumpDriver::spawn(client);
        driver.set("p1", true).unwrap();
        driver.set("p2", true).unwrap();
        driver.set("p1", false).unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            pump_payloads(&mut eventloop),
            vec![
                ("pump/p1/set".to_string(), "ON".to_string()),
                ("pump/p2/set".to_string(), "ON".to_string()),
                ("pump/p1/set".to_string(), "OFF".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn off_survives_a_full_request_channel() {
        let (client, mut eventloop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 2);
        let driver = MqttPumpDriver::spawn(client.clone());
        driver.set("p1", true).unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        client
            .try_publish("notice/r1", QoS::AtLeastOnce, false, "{}")
            .unwrap();
        assert!(client
            .try_publish("notice/r1", QoS::AtLeastOnce, false, "{}")
            .is_err());

        // Accepted even though the client has no room for it yet.
        driver.set("p1", false).unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            pump_payloads(&mut eventloop),
            vec![("pump/p1/set".to_string(), "ON".to_string())]
        );

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            pump_payloads(&mut eventloop),
            vec![("pump/p1/set".to_string(), "OFF".to_string())]
        );
    }

    #[tokio::test]
    async fn driver_reports_stopped_forwarder_as_pump_error() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let driver = MqttPumpDriver { tx };
        let err = driver.set("p1", false).unwrap_err();
        assert!(matches!(err, ControlError::Pump { device, .. } if device == "p1"));
    }
}
