//! SHDR line protocol parser.
//!
//! A data line is `timestamp|key|value[|key|value...]`. The shape of the
//! tokens after the first key depends on that key's data item, which the
//! parser asks for through [`DataItemLookup`]. Lines starting with `* ` are
//! protocol commands.

use tracing::warn;

use crate::descriptor::DataItemDescriptor;

/// Resolves adapter keys to data items while parsing.
pub trait DataItemLookup {
    fn lookup(&self, key: &str) -> Option<&DataItemDescriptor>;
}

/// Asset directive keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveKind {
    Asset,
    UpdateAsset,
    RemoveAsset,
    RemoveAllAssets,
}

impl DirectiveKind {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "@ASSET@" => Some(Self::Asset),
            "@UPDATE_ASSET@" => Some(Self::UpdateAsset),
            "@REMOVE_ASSET@" => Some(Self::RemoveAsset),
            "@REMOVE_ALL_ASSETS@" => Some(Self::RemoveAllAssets),
            _ => None,
        }
    }

    pub fn token(&self) -> &'static str {
        match self {
            Self::Asset => "@ASSET@",
            Self::UpdateAsset => "@UPDATE_ASSET@",
            Self::RemoveAsset => "@REMOVE_ASSET@",
            Self::RemoveAllAssets => "@REMOVE_ALL_ASSETS@",
        }
    }
}

/// An asset directive with its raw tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetDirective {
    pub kind: DirectiveKind,
    pub tokens: Vec<String>,
}

/// Value portion of a candidate observation, as shaped by the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateValue {
    Scalar(String),
    List(Vec<String>),
    TimeSeries {
        sample_count: u64,
        sample_rate: f64,
        samples: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValueEntry {
    pub key: String,
    pub value: CandidateValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShdrEntry {
    Value(ValueEntry),
    Asset(AssetDirective),
}

/// Everything reported on one data line.
#[derive(Debug, Clone, PartialEq)]
pub struct ShdrBatch {
    /// Raw adapter timestamp; `None` when the field was empty.
    pub timestamp: Option<String>,
    pub duration: Option<String>,
    pub entries: Vec<ShdrEntry>,
}

/// One `id|factor|offset` triple of a calibration command.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationEntry {
    pub key: String,
    pub factor: f64,
    pub offset: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolCommand {
    Calibration(Vec<CalibrationEntry>),
    /// `manufacturer`, `serialNumber` or `station`.
    Description { field: String, value: String },
    Uuid(String),
    Other { name: String, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ShdrLine {
    Data(ShdrBatch),
    Command(ProtocolCommand),
    Empty,
}

/// Parse one line.
pub fn parse_line<L: DataItemLookup + ?Sized>(line: &str, lookup: &L) -> ShdrLine {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return ShdrLine::Empty;
    }
    if let Some(command) = line.strip_prefix("* ") {
        return ShdrLine::Command(parse_command(command));
    }

    let fields: Vec<&str> = line.split('|').collect();
    let (timestamp, duration) = match fields[0].split_once('@') {
        Some((time, duration)) => (time, Some(duration.to_string())),
        None => (fields[0], None),
    };
    let timestamp = (!timestamp.is_empty()).then(|| timestamp.to_string());

    let mut batch = ShdrBatch {
        timestamp,
        duration,
        entries: Vec::new(),
    };
    if fields.len() < 2 {
        warn!(category = "shdr", "Line carries no data: {}", line);
        return ShdrLine::Data(batch);
    }

    let first = fields[1];
    let rest = &fields[2..];

    if let Some(kind) = DirectiveKind::from_token(first) {
        batch.entries.push(ShdrEntry::Asset(AssetDirective {
            kind,
            tokens: rest.iter().map(|s| s.to_string()).collect(),
        }));
        return ShdrLine::Data(batch);
    }

    match lookup.lookup(first) {
        Some(descriptor) if descriptor.is_time_series() => {
            batch.entries.push(ShdrEntry::Value(ValueEntry {
                key: first.to_string(),
                value: time_series(rest),
            }));
        }
        Some(descriptor) if descriptor.takes_all_tokens() => {
            batch.entries.push(ShdrEntry::Value(ValueEntry {
                key: first.to_string(),
                value: CandidateValue::List(rest.iter().map(|s| s.to_string()).collect()),
            }));
        }
        _ => {
            for pair in fields[1..].chunks(2) {
                match pair {
                    [key, value] => batch.entries.push(ShdrEntry::Value(ValueEntry {
                        key: key.to_string(),
                        value: CandidateValue::Scalar(value.to_string()),
                    })),
                    [key] => warn!(category = "shdr", "No value for key {}", key),
                    _ => {}
                }
            }
        }
    }
    ShdrLine::Data(batch)
}

fn time_series(tokens: &[&str]) -> CandidateValue {
    let sample_count = tokens
        .first()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0);
    let sample_rate = tokens
        .get(1)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0.0);
    let samples = tokens
        .iter()
        .skip(2)
        .flat_map(|s| s.split_whitespace())
        .map(str::to_string)
        .collect();
    CandidateValue::TimeSeries {
        sample_count,
        sample_rate,
        samples,
    }
}

fn parse_command(command: &str) -> ProtocolCommand {
    let (name, value) = match command.split_once(':') {
        Some((name, value)) => (name.trim(), value.trim()),
        None => (command.trim(), ""),
    };

    match name {
        "calibration" => ProtocolCommand::Calibration(parse_calibration(value)),
        "manufacturer" | "serialNumber" | "station" => ProtocolCommand::Description {
            field: name.to_string(),
            value: value.to_string(),
        },
        "uuid" => ProtocolCommand::Uuid(value.to_string()),
        _ => ProtocolCommand::Other {
            name: name.to_string(),
            value: value.to_string(),
        },
    }
}

fn parse_calibration(value: &str) -> Vec<CalibrationEntry> {
    let tokens: Vec<&str> = value.split('|').map(str::trim).collect();
    let mut entries = Vec::new();
    for triple in tokens.chunks(3) {
        let [key, factor, offset] = triple else {
            warn!(category = "shdr", "Incomplete calibration entry: {:?}", triple);
            continue;
        };
        match (factor.parse::<f64>(), offset.parse::<f64>()) {
            (Ok(factor), Ok(offset)) => entries.push(CalibrationEntry {
                key: key.to_string(),
                factor,
                offset,
            }),
            _ => warn!(category = "shdr", "Invalid calibration for {}", key),
        }
    }
    entries
}

const MULTILINE_MARKER: &str = "--multiline--";

#[derive(Debug)]
struct PendingBlock {
    head: String,
    tag: String,
    body: String,
}

/// Joins `--multiline--TAG` blocks into a single line.
///
/// The line that opens a block ends with the tag in place of the asset
/// body. Following lines are collected until one equal to the tag, then the
/// opening line is returned with the collected text in place of the tag.
#[derive(Debug, Default)]
pub struct MultilineAssembler {
    pending: Option<PendingBlock>,
}

impl MultilineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a raw line. Returns a complete line when one is ready.
    pub fn push(&mut self, line: &str) -> Option<String> {
        let line = line.trim_end_matches(['\r', '\n']);

        if let Some(block) = self.pending.as_mut() {
            if line.trim() == block.tag {
                let block = self.pending.take()?;
                return Some(format!("{}{}", block.head, block.body));
            }
            block.body.push_str(line);
            return None;
        }

        match line.find(MULTILINE_MARKER) {
            Some(start) => {
                let tag = line[start..].split('|').next().unwrap_or("").trim();
                self.pending = Some(PendingBlock {
                    head: line[..start].to_string(),
                    tag: tag.to_string(),
                    body: String::new(),
                });
                None
            }
            None => Some(line.to_string()),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}
