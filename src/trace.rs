//! Trace file wire format: tab-separated `<timestamp>\t<signed_length>[\t<json>]`
//! lines. See spec.md §6.

use serde_json::{json, Map, Value};

use crate::model::{Metadata, OutputPacket, ScheduledPacket, SimId, Strategy};
use crate::{Error, Result};

/// Parses an input trace: one packet per line, a third tab-separated field marks a
/// generic dummy slot awaiting strategy-specific rewriting by the injector. Any
/// third field present (JSON or not) is treated purely as the `real` marker here —
/// the injector, not the parser, decides what a dummy slot becomes.
pub fn parse_trace(input: &str) -> Result<Vec<ScheduledPacket>> {
    let mut packets = Vec::new();
    for (lineno, raw) in input.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.splitn(3, '\t');
        let ts_str = fields
            .next()
            .ok_or_else(|| malformed(lineno, "missing timestamp"))?;
        let len_str = fields
            .next()
            .ok_or_else(|| malformed(lineno, "missing length"))?;
        let timestamp: f64 = ts_str
            .parse()
            .map_err(|_| malformed(lineno, "timestamp is not a float"))?;
        let length: i64 = len_str
            .parse()
            .map_err(|_| malformed(lineno, "length is not an integer"))?;
        let real = fields.next().is_none();
        packets.push(ScheduledPacket {
            timestamp,
            length,
            real,
        });
    }
    Ok(packets)
}

/// Renders the received trace in the same tab-separated shape: two fields for real
/// packets, three (with embedded single-line JSON) for dummy/repair packets.
pub fn write_trace(packets: &[OutputPacket]) -> String {
    let mut out = String::new();
    for p in packets {
        out.push_str(&format!("{}\t{}", p.timestamp, p.length));
        if let Some(meta) = &p.metadata {
            out.push('\t');
            out.push_str(&meta.to_json().to_string());
        }
        out.push('\n');
    }
    out
}

fn malformed(lineno: usize, why: &str) -> Error {
    Error::MalformedInput(format!("line {}: {}", lineno + 1, why))
}

impl Metadata {
    /// Serializes to the exact shapes named in spec.md §6's repair metadata schema.
    pub fn to_json(&self) -> Value {
        match self {
            Metadata::Dummy { strategy, info } => {
                let mut obj = Map::new();
                obj.insert("type".to_string(), json!("DUMMY"));
                obj.insert("strategy".to_string(), json!(strategy.as_str()));
                if let Some(info) = info {
                    obj.insert("info".to_string(), json!(info));
                }
                Value::Object(obj)
            }
            Metadata::RepairB {
                block_id,
                protected_count,
            } => json!({
                "type": "FEC",
                "strategy": "B",
                "block_id": block_id,
                "protected_count": protected_count,
            }),
            Metadata::RepairC { covered_ids } => json!({
                "type": "FEC",
                "strategy": "C",
                "covered_ids": covered_ids,
            }),
            Metadata::RepairD { start_id, end_id } => json!({
                "type": "FEC",
                "strategy": "D",
                "start_id": start_id,
                "end_id": end_id,
            }),
        }
    }

    /// Parses the shapes `to_json` produces. Unknown `type`/`strategy` combinations
    /// or missing required keys are `Error::MalformedInput`.
    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::MalformedInput("metadata is not a JSON object".to_string()))?;
        let kind = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedInput("metadata missing \"type\"".to_string()))?;

        match kind {
            "DUMMY" => {
                let strategy = parse_strategy(obj)?;
                let info = obj
                    .get("info")
                    .and_then(Value::as_str)
                    .map(|s| s.to_string());
                Ok(Metadata::Dummy { strategy, info })
            }
            "FEC" => match parse_strategy(obj)? {
                Strategy::B => Ok(Metadata::RepairB {
                    block_id: required_u64(obj, "block_id")?,
                    protected_count: required_u64(obj, "protected_count")?,
                }),
                Strategy::C => {
                    let covered_ids = obj
                        .get("covered_ids")
                        .and_then(Value::as_array)
                        .ok_or_else(|| {
                            Error::MalformedInput("FEC/C missing \"covered_ids\"".to_string())
                        })?
                        .iter()
                        .map(|v| {
                            v.as_u64().ok_or_else(|| {
                                Error::MalformedInput("covered_ids entry not an integer".to_string())
                            })
                        })
                        .collect::<Result<Vec<SimId>>>()?;
                    Ok(Metadata::RepairC { covered_ids })
                }
                Strategy::D => Ok(Metadata::RepairD {
                    start_id: required_u64(obj, "start_id")?,
                    end_id: required_u64(obj, "end_id")?,
                }),
                Strategy::A => Err(Error::MalformedInput(
                    "FEC metadata cannot carry strategy A".to_string(),
                )),
            },
            other => Err(Error::MalformedInput(format!("unknown metadata type {other:?}"))),
        }
    }
}

fn parse_strategy(obj: &Map<String, Value>) -> Result<Strategy> {
    let raw = obj
        .get("strategy")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::MalformedInput("metadata missing \"strategy\"".to_string()))?;
    raw.parse()
}

fn required_u64(obj: &Map<String, Value>, key: &str) -> Result<u64> {
    obj.get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::MalformedInput(format!("metadata missing \"{key}\"")))
}
