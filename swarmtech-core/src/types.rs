//! Shared data model for field agents, their locations, and the team chat.
//!
//! These are the values carried inside the replicated document. They are
//! plain data: identity and ordering metadata (stamps, sequence numbers)
//! live in [`crate::document`], not here.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DocumentError;
use crate::utils::{now_millis, pick_color, sanitize_input};

/// Agent identifier, unique within a room for the agent's session lifetime.
pub type AgentId = String;

/// Operational role of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Field,
    Command,
    Volunteer,
    Police,
    Fire,
    NationalGuard,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::Field,
        Role::Command,
        Role::Volunteer,
        Role::Police,
        Role::Fire,
        Role::NationalGuard,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Field => "field",
            Role::Command => "command",
            Role::Volunteer => "volunteer",
            Role::Police => "police",
            Role::Fire => "fire",
            Role::NationalGuard => "national-guard",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = DocumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| DocumentError::UnknownRole(s.to_string()))
    }
}

/// Identity record for a participant. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub role: Role,
    /// Milliseconds since the Unix epoch.
    pub joined_at: u64,
    /// Hex colour used for map markers.
    pub color: String,
    pub public_key: Option<String>,
}

impl Agent {
    /// Create an agent with a fresh id, joined now.
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), name, role)
    }

    /// Create with an explicit id. The colour is stable for a given id.
    pub fn with_id(id: impl Into<AgentId>, name: impl Into<String>, role: Role) -> Self {
        let id = id.into();
        let color = pick_color(&id).to_string();
        Self {
            id,
            name: name.into(),
            role,
            joined_at: now_millis(),
            color,
            public_key: None,
        }
    }
}

/// Optional sensor readings attached to a location sample.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LocationOptions {
    /// Metres.
    pub accuracy: Option<f64>,
    /// Degrees.
    pub heading: Option<f64>,
    /// Metres per second.
    pub speed: Option<f64>,
    /// Metres.
    pub altitude: Option<f64>,
}

/// Latest known position of an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentLocation {
    pub agent_id: AgentId,
    pub longitude: f64,
    pub latitude: f64,
    /// Milliseconds since the Unix epoch; the LWW clock for this entry.
    pub timestamp: u64,
    pub accuracy: Option<f64>,
    pub heading: Option<f64>,
    pub speed: Option<f64>,
    pub altitude: Option<f64>,
}

const EARTH_RADIUS_M: f64 = 6_371_000.0;

impl AgentLocation {
    /// Build a sample stamped with the current time.
    pub fn new(agent_id: impl Into<AgentId>, longitude: f64, latitude: f64, options: LocationOptions) -> Self {
        Self::at(agent_id, longitude, latitude, now_millis(), options)
    }

    /// Build a sample with an explicit timestamp.
    pub fn at(
        agent_id: impl Into<AgentId>,
        longitude: f64,
        latitude: f64,
        timestamp: u64,
        options: LocationOptions,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            longitude,
            latitude,
            timestamp,
            accuracy: options.accuracy,
            heading: options.heading,
            speed: options.speed,
            altitude: options.altitude,
        }
    }

    /// Great-circle distance to another location in metres (haversine).
    pub fn distance_to(&self, other: &AgentLocation) -> f64 {
        let phi1 = self.latitude.to_radians();
        let phi2 = other.latitude.to_radians();
        let d_phi = (other.latitude - self.latitude).to_radians();
        let d_lambda = (other.longitude - self.longitude).to_radians();

        let a = (d_phi / 2.0).sin().powi(2)
            + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_M * c
    }

    /// Render as a GeoJSON `Feature<Point>` for map layers.
    pub fn to_geojson(&self) -> serde_json::Value {
        let mut properties = serde_json::Map::new();
        properties.insert("agentId".into(), self.agent_id.clone().into());
        properties.insert("timestamp".into(), self.timestamp.into());
        for (key, value) in [
            ("accuracy", self.accuracy),
            ("heading", self.heading),
            ("speed", self.speed),
            ("altitude", self.altitude),
        ] {
            if let Some(v) = value {
                properties.insert(key.into(), v.into());
            }
        }

        serde_json::json!({
            "type": "Feature",
            "geometry": {
                "type": "Point",
                "coordinates": [self.longitude, self.latitude],
            },
            "properties": properties,
        })
    }
}

/// Kind of chat entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    System,
    Emergency,
}

/// A single entry in the team message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub agent_id: AgentId,
    pub agent_name: String,
    pub content: String,
    /// Milliseconds since the Unix epoch (display only, not used for ordering).
    pub timestamp: u64,
    pub kind: MessageKind,
}

impl ChatMessage {
    /// Author a new message. Content is trimmed and capped at 500 characters.
    pub fn new(author: &Agent, content: &str, kind: MessageKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: author.id.clone(),
            agent_name: author.name.clone(),
            content: sanitize_input(content),
            timestamp: now_millis(),
            kind,
        }
    }
}
