//! # Job State Record
//!
//! The shared, stage-structured record tracking one analysis run. Each stage is
//! an ordered group of steps; each step is the slot one plugin fills in.
//!
//! Step documents are stored as JSON inside the record with the key names the
//! dispatcher writes (`Name`, `Status`, `Started_on`, ...). Each step keeps its
//! original document, so a read-modify-write of one step leaves every other
//! step exactly as the dispatcher wrote it.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Status of a step (and of the job as a whole)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Started,
    Ongoing,
    Success,
    Failure,
    Completed,
    #[serde(rename = "updating_db", alias = "updating")]
    Updating,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Started => "started",
            StepStatus::Ongoing => "ongoing",
            StepStatus::Success => "success",
            StepStatus::Failure => "failure",
            StepStatus::Completed => "completed",
            StepStatus::Updating => "updating_db",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Success | StepStatus::Failure | StepStatus::Completed
        )
    }

    /// Terminal states never revert to a non-terminal one
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        !self.is_terminal() || next.is_terminal()
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(StepStatus::Started),
            "ongoing" => Ok(StepStatus::Ongoing),
            "success" => Ok(StepStatus::Success),
            "failure" => Ok(StepStatus::Failure),
            "completed" => Ok(StepStatus::Completed),
            "updating_db" | "updating" => Ok(StepStatus::Updating),
            other => Err(format!("unknown step status: {other}")),
        }
    }
}

const NAME: &str = "Name";
const VERSION: &str = "Version";
const CONFIG: &str = "Config";
const STATUS: &str = "Status";
const RESULT: &str = "Result";
const STARTED_ON: &str = "Started_on";
const ENDED_ON: &str = "Ended_on";

/// One plugin's slot within a stage
///
/// Held as the JSON object the dispatcher wrote. Accessors read the keys the
/// runtime interprets and tolerate values they cannot parse; setters replace
/// a single key. A step that is never written to serialises back exactly as it
/// was read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Step(Map<String, Value>);

impl Step {
    pub fn new(name: impl Into<String>, status: StepStatus) -> Self {
        let mut doc = Map::new();
        doc.insert(NAME.to_string(), Value::String(name.into()));
        doc.insert(VERSION.to_string(), Value::String(String::new()));
        doc.insert(CONFIG.to_string(), Value::Null);
        doc.insert(STATUS.to_string(), Value::String(status.as_str().to_string()));
        doc.insert(RESULT.to_string(), Value::Null);
        doc.insert(STARTED_ON.to_string(), Value::String(String::new()));
        doc.insert(ENDED_ON.to_string(), Value::String(String::new()));
        Self(doc)
    }

    pub fn from_document(doc: Map<String, Value>) -> Self {
        Self(doc)
    }

    pub fn document(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn name(&self) -> &str {
        self.str_field(NAME).unwrap_or_default()
    }

    pub fn version(&self) -> &str {
        self.str_field(VERSION).unwrap_or_default()
    }

    pub fn config(&self) -> &Value {
        self.0.get(CONFIG).unwrap_or(&Value::Null)
    }

    /// `None` when unset or not a status the runtime knows
    pub fn status(&self) -> Option<StepStatus> {
        self.str_field(STATUS)?.parse().ok()
    }

    pub fn result(&self) -> &Value {
        self.0.get(RESULT).unwrap_or(&Value::Null)
    }

    /// `None` when unset or not an RFC3339 timestamp
    pub fn started_on(&self) -> Option<DateTime<Utc>> {
        self.timestamp(STARTED_ON)
    }

    pub fn ended_on(&self) -> Option<DateTime<Utc>> {
        self.timestamp(ENDED_ON)
    }

    /// Any key, including ones the runtime does not interpret
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set_status(&mut self, status: StepStatus) {
        self.0
            .insert(STATUS.to_string(), Value::String(status.as_str().to_string()));
    }

    pub fn set_result(&mut self, result: Value) {
        self.0.insert(RESULT.to_string(), result);
    }

    pub fn set_started_on(&mut self, ts: DateTime<Utc>) {
        self.0.insert(STARTED_ON.to_string(), render_timestamp(ts));
    }

    pub fn set_ended_on(&mut self, ts: DateTime<Utc>) {
        self.0.insert(ENDED_ON.to_string(), render_timestamp(ts));
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.0.get(key)?.as_str()
    }

    fn timestamp(&self, key: &str) -> Option<DateTime<Utc>> {
        let raw = self.str_field(key).filter(|raw| !raw.is_empty())?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }
}

fn render_timestamp(ts: DateTime<Utc>) -> Value {
    Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

/// Shared, stage-structured record for one analysis run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStateRecord {
    pub id: Uuid,
    /// Index of the stage currently executing
    pub stage: usize,
    /// Stages in execution order, each an ordered list of steps
    pub steps: Vec<Vec<Step>>,
    /// Per-job configuration, keyed by plugin name
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub status: Option<StepStatus>,
    #[serde(default)]
    pub organization_id: Option<Uuid>,
    #[serde(default)]
    pub project_id: Option<Uuid>,
}

impl JobStateRecord {
    pub fn new(id: Uuid, steps: Vec<Vec<Step>>) -> Self {
        Self {
            id,
            stage: 0,
            steps,
            config: serde_json::Value::Null,
            status: None,
            organization_id: None,
            project_id: None,
        }
    }

    pub fn stage_count(&self) -> usize {
        self.steps.len()
    }

    pub fn current_stage(&self) -> Option<&[Step]> {
        self.steps.get(self.stage).map(Vec::as_slice)
    }

    pub fn current_stage_mut(&mut self) -> Option<&mut Vec<Step>> {
        self.steps.get_mut(self.stage)
    }

    /// Step named `plugin` in the current stage
    pub fn find_step(&self, plugin: &str) -> Option<&Step> {
        self.current_stage()?.iter().find(|s| s.name() == plugin)
    }

    /// Configuration block a plugin receives from the job
    pub fn plugin_config(&self, plugin: &str) -> Option<&serde_json::Value> {
        self.config.get(plugin)
    }
}
