//! Domain types shared by the parser, the ingestion controller, and the GUI
//! wire format.

use serde::{Deserialize, Serialize};

/// Ordinal entry type, matching the `type` element of a `traceentry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryType {
    Debug = 0,
    Error = 1,
    Log = 2,
    Watch = 3,
}

impl EntryType {
    pub fn from_ordinal(v: u32) -> Option<Self> {
        match v {
            0 => Some(EntryType::Debug),
            1 => Some(EntryType::Error),
            2 => Some(EntryType::Log),
            3 => Some(EntryType::Watch),
            _ => None,
        }
    }

    pub fn ordinal(self) -> u32 {
        self as u32
    }
}

/// Type tag of a `<variable>` element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariableType {
    String,
    Number,
    Float,
    Boolean,
}

impl VariableType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(VariableType::String),
            "number" => Some(VariableType::Number),
            "float" => Some(VariableType::Float),
            "boolean" => Some(VariableType::Boolean),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VariableType::String => "string",
            VariableType::Number => "number",
            VariableType::Float => "float",
            VariableType::Boolean => "boolean",
        }
    }
}

/// A single `<variable>` snapshot attached to a trace entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub var_type: VariableType,
    pub value: String,
}

/// One frame of a captured backtrace, in outermost-to-innermost arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub module: String,
    pub function: String,
    pub function_offset: u64,
    pub source_file: String,
    pub line_number: u32,
}

/// A producer-declared trace key (group toggle), persisted regardless of
/// `enabled` for auditing purposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceKey {
    pub name: String,
    pub enabled: bool,
}

/// One runtime emission at a trace point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub pid: u32,
    pub process_start_time: i64,
    pub tid: u32,
    pub timestamp: i64,
    pub entry_type: EntryType,
    pub path: String,
    pub line: u32,
    pub function: String,
    pub process_name: String,
    pub group: Option<String>,
    pub message: String,
    pub stack_position: u64,
    pub variables: Vec<Variable>,
    pub backtrace: Vec<StackFrame>,
    pub trace_keys: Vec<TraceKey>,
}

/// A producer process shutting down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessShutdownEvent {
    pub pid: u32,
    pub start_time: i64,
    pub stop_time: i64,
    pub process_name: String,
}

/// The engine's page-count ceiling, expressed as "unlimited" or a byte budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaxSize {
    Unlimited,
    Bytes(u64),
}

/// `<storageconfiguration>` settings, applied idempotently by the ingestion
/// controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfiguration {
    pub max_size: MaxSize,
    pub shrink_by: u8,
    pub archive_dir: String,
}

impl StorageConfiguration {
    /// Clamp `shrink_by` into `[1, 100]`, as required by spec.md §4.4.
    pub fn clamped(mut self) -> Self {
        self.shrink_by = self.shrink_by.clamp(1, 100);
        self
    }
}

/// A single parsed unit handed from the streaming parser to the ingestion
/// controller.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedRecord {
    Entry(TraceEntry),
    Shutdown(ProcessShutdownEvent),
    StorageConfig(StorageConfiguration),
}
