//! Closed vocabularies shared by every room task: irrigation mode, steering
//! phase, and pump operation kind.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    #[serde(rename = "p0")]
    P0Monitoring,
    #[serde(rename = "p1")]
    P1Saturation,
    #[serde(rename = "p2")]
    P2Maintenance,
    #[serde(rename = "p3")]
    P3NightDryback,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::P0Monitoring,
        Phase::P1Saturation,
        Phase::P2Maintenance,
        Phase::P3NightDryback,
    ];

    pub fn code(self) -> &'static str {
        match self {
            Self::P0Monitoring => "p0",
            Self::P1Saturation => "p1",
            Self::P2Maintenance => "p2",
            Self::P3NightDryback => "p3",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Self::P0Monitoring => 0,
            Self::P1Saturation => 1,
            Self::P2Maintenance => 2,
            Self::P3NightDryback => 3,
        }
    }

    /// The only phase the steering cycle may move to from `self`.
    pub fn successor(self) -> Phase {
        match self {
            Self::P0Monitoring => Self::P1Saturation,
            Self::P1Saturation => Self::P2Maintenance,
            Self::P2Maintenance => Self::P3NightDryback,
            Self::P3NightDryback => Self::P0Monitoring,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::P0Monitoring => "P0 monitoring",
            Self::P1Saturation => "P1 saturation",
            Self::P2Maintenance => "P2 maintenance",
            Self::P3NightDryback => "P3 night dryback",
        };
        f.write_str(name)
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "p0" => Ok(Self::P0Monitoring),
            "p1" => Ok(Self::P1Saturation),
            "p2" => Ok(Self::P2Maintenance),
            "p3" => Ok(Self::P3NightDryback),
            other => Err(format!("unknown phase '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// IrrigationMode
// ---------------------------------------------------------------------------

/// Set externally. Serialized as `disabled`, `config`, `automatic` or
/// `manual:<phase>`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum IrrigationMode {
    #[default]
    Disabled,
    Config,
    Automatic,
    Manual(Phase),
}

impl fmt::Display for IrrigationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => f.write_str("disabled"),
            Self::Config => f.write_str("config"),
            Self::Automatic => f.write_str("automatic"),
            Self::Manual(phase) => write!(f, "manual:{}", phase.code()),
        }
    }
}

impl FromStr for IrrigationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "disabled" | "off" => Ok(Self::Disabled),
            "config" => Ok(Self::Config),
            "automatic" | "auto" => Ok(Self::Automatic),
            other => match other.strip_prefix("manual") {
                Some(rest) => {
                    let phase = rest.trim_start_matches([':', '_', ' ']);
                    if phase.is_empty() {
                        return Err("manual mode needs a phase (manual:p0..p3)".to_string());
                    }
                    Ok(Self::Manual(phase.parse()?))
                }
                None => Err(format!("unknown irrigation mode '{other}'")),
            },
        }
    }
}

impl TryFrom<String> for IrrigationMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IrrigationMode> for String {
    fn from(mode: IrrigationMode) -> Self {
        mode.to_string()
    }
}

// ---------------------------------------------------------------------------
// OperationKind
// ---------------------------------------------------------------------------

/// Category of pump usage, used for arbitration between subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Hydro,
    Retrieve,
    CropSteering,
    PlantWatering,
    FeedNutrients,
}

impl OperationKind {
    pub const ALL: [OperationKind; 5] = [
        OperationKind::Hydro,
        OperationKind::Retrieve,
        OperationKind::CropSteering,
        OperationKind::PlantWatering,
        OperationKind::FeedNutrients,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hydro => "hydro",
            Self::Retrieve => "retrieve",
            Self::CropSteering => "crop_steering",
            Self::PlantWatering => "plant_watering",
            Self::FeedNutrients => "feed_nutrients",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s.trim())
            .ok_or_else(|| format!("unknown operation kind '{s}'"))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
