//! Domain entities carried in event payloads and handed to collaborators.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type Metadata = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChaseType {
    #[default]
    Chase,
    Rocket,
    Weather,
    Aircraft,
}

impl ChaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChaseType::Chase => "chase",
            ChaseType::Rocket => "rocket",
            ChaseType::Weather => "weather",
            ChaseType::Aircraft => "aircraft",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
}

/// A live stream source attached to a chase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stream {
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network: String,
    /// Container format, e.g. `m3u8` or `mp4`.
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
}

/// A live event: police chase, rocket launch, storm, aircraft activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chase {
    pub id: Uuid,
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub chase_type: ChaseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub city: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub state: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub country: String,
    #[serde(default)]
    pub live: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thumbnail_url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub streams: Vec<Stream>,
    #[serde(default)]
    pub view_count: i64,
    #[serde(default)]
    pub share_count: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<Uuid>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chase {
    pub fn new(title: impl Into<String>, chase_type: ChaseType) -> Self {
        let now = Utc::now();
        Chase {
            id: Uuid::new_v4(),
            title: title.into(),
            description: String::new(),
            chase_type,
            location: None,
            city: String::new(),
            state: String::new(),
            country: String::new(),
            live: false,
            started_at: None,
            ended_at: None,
            thumbnail_url: String::new(),
            streams: Vec::new(),
            view_count: 0,
            share_count: 0,
            source: String::new(),
            source_url: String::new(),
            created_by: None,
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthProvider {
    Google,
    Apple,
    Facebook,
    Twitter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    /// OAuth provider user id.
    pub external_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub photo_url: String,
    pub provider: AuthProvider,
    #[serde(default)]
    pub notifications_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_login_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AircraftCategory {
    Media,
    LawEnforcement,
    Military,
    Medical,
    Firefighting,
    #[default]
    General,
}

/// An ADS-B tracked aircraft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aircraft {
    pub id: Uuid,
    /// ICAO 24-bit address, hex encoded.
    pub icao: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub callsign: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub registration: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    /// Feet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<i32>,
    /// Knots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ground_speed: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<i32>,
    #[serde(default)]
    pub category: AircraftCategory,
    #[serde(default)]
    pub on_ground: bool,
    pub last_seen_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_id: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: Metadata,
}

impl Aircraft {
    pub fn new(icao: impl Into<String>, last_seen_at: DateTime<Utc>) -> Self {
        Aircraft {
            id: Uuid::new_v4(),
            icao: icao.into(),
            callsign: String::new(),
            registration: String::new(),
            latitude: None,
            longitude: None,
            altitude: None,
            ground_speed: None,
            track: None,
            category: AircraftCategory::default(),
            on_ground: false,
            last_seen_at,
            cluster_id: String::new(),
            metadata: Metadata::new(),
        }
    }
}
