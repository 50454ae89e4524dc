//! Streaming parser: assembles [`ParsedRecord`]s from an unbounded
//! concatenation of per-connection byte fragments (spec.md §4.3).
//!
//! Restartable across fragment boundaries — partial tags remain buffered
//! until [`StreamingParser::feed`] supplies the rest. Malformed input never
//! terminates the connection: an unrecognized or incomplete element is
//! logged and the parser resynchronizes at the next well-formed top-level
//! element, by construction rather than by any special-cased recovery path
//! (see the module-level notes below).

mod tokenizer;

use std::collections::VecDeque;

use tracing::warn;

use crate::model::{
    EntryType, MaxSize, ParsedRecord, ProcessShutdownEvent, StackFrame, StorageConfiguration,
    TraceEntry, TraceKey, Variable, VariableType,
};
use tokenizer::{next_step, Step, Token};

fn attr<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

#[derive(Default)]
struct FrameBuilder {
    module: Option<String>,
    function: Option<String>,
    function_offset: u64,
    source_file: Option<String>,
    line_number: u32,
}

impl FrameBuilder {
    fn finish(self) -> StackFrame {
        StackFrame {
            module: self.module.unwrap_or_default(),
            function: self.function.unwrap_or_default(),
            function_offset: self.function_offset,
            source_file: self.source_file.unwrap_or_default(),
            line_number: self.line_number,
        }
    }
}

struct EntryBuilder {
    pid: u32,
    process_start_time: i64,
    tid: u32,
    timestamp: i64,
    entry_type: Option<EntryType>,
    path: Option<String>,
    line: Option<u32>,
    function: Option<String>,
    process_name: Option<String>,
    group: Option<String>,
    message: Option<String>,
    stack_position: u64,
    variables: Vec<Variable>,
    backtrace: Vec<StackFrame>,
    trace_keys: Vec<TraceKey>,
    in_frame: bool,
    current_frame: Option<FrameBuilder>,
    current_variable: Option<(String, VariableType)>,
    current_key_enabled: bool,
    current_line_no: u32,
}

impl EntryBuilder {
    fn finish(self) -> Option<TraceEntry> {
        Some(TraceEntry {
            pid: self.pid,
            process_start_time: self.process_start_time,
            tid: self.tid,
            timestamp: self.timestamp,
            entry_type: self.entry_type?,
            path: self.path?,
            line: self.line?,
            function: self.function?,
            process_name: self.process_name?,
            group: self.group,
            message: self.message.unwrap_or_default(),
            stack_position: self.stack_position,
            variables: self.variables,
            backtrace: self.backtrace,
            trace_keys: self.trace_keys,
        })
    }

    /// Dispatch the close of a nested element. `in_frame` disambiguates
    /// `location`/`function` by enclosing element rather than by handler
    /// order (see spec.md §9's note on the original's unreachable branch).
    fn close_child(&mut self, name: &str, text: String) {
        match name {
            "processname" => self.process_name = Some(text),
            "stackposition" => self.stack_position = text.parse().unwrap_or(0),
            "type" => self.entry_type = text.parse::<u32>().ok().and_then(EntryType::from_ordinal),
            "location" if self.in_frame => {
                if let Some(f) = &mut self.current_frame {
                    f.source_file = Some(text);
                    f.line_number = self.current_line_no;
                }
            }
            "location" => {
                self.path = Some(text);
                self.line = Some(self.current_line_no);
            }
            "group" => self.group = Some(text),
            "function" if self.in_frame => {
                if let Some(f) = &mut self.current_frame {
                    f.function = Some(text);
                }
            }
            "function" => self.function = Some(text),
            "message" => self.message = Some(text),
            "module" => {
                if let Some(f) = &mut self.current_frame {
                    f.module = Some(text);
                }
            }
            "variable" => {
                if let Some((name, var_type)) = self.current_variable.take() {
                    self.variables.push(Variable {
                        name,
                        var_type,
                        value: text,
                    });
                }
            }
            "frame" => {
                self.in_frame = false;
                if let Some(f) = self.current_frame.take() {
                    self.backtrace.push(f.finish());
                }
            }
            "key" => {
                self.trace_keys.push(TraceKey {
                    name: text,
                    enabled: self.current_key_enabled,
                });
                self.current_key_enabled = false;
            }
            _ => {}
        }
    }

    fn open_child(&mut self, name: &str, attrs: &[(String, String)]) {
        match name {
            "variable" => {
                let var_name = attr(attrs, "name").unwrap_or_default().to_string();
                let var_type = attr(attrs, "type")
                    .and_then(VariableType::parse)
                    .unwrap_or(VariableType::String);
                self.current_variable = Some((var_name, var_type));
            }
            "location" => {
                self.current_line_no = attr(attrs, "lineno").and_then(|v| v.parse().ok()).unwrap_or(0);
            }
            "frame" => {
                self.in_frame = true;
                self.current_frame = Some(FrameBuilder::default());
            }
            "function" if self.in_frame => {
                if let Some(f) = &mut self.current_frame {
                    f.function_offset = attr(attrs, "offset").and_then(|v| v.parse().ok()).unwrap_or(0);
                }
            }
            "key" => {
                self.current_key_enabled = attr(attrs, "enabled") == Some("true");
            }
            _ => {}
        }
    }
}

struct ShutdownBuilder {
    pid: u32,
    start_time: i64,
    stop_time: i64,
}

struct ConfigBuilder {
    max_size: MaxSize,
    shrink_by: u8,
}

enum Building {
    Entry(EntryBuilder),
    Shutdown(ShutdownBuilder),
    Config(ConfigBuilder),
}

/// Parses one producer connection's byte stream into [`ParsedRecord`]s.
pub struct StreamingParser {
    buf: Vec<u8>,
    pos: usize,
    stack: Vec<String>,
    current_text: String,
    building: Option<Building>,
    pending: VecDeque<ParsedRecord>,
}

impl Default for StreamingParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingParser {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            stack: Vec::new(),
            current_text: String::new(),
            building: None,
            pending: VecDeque::new(),
        }
    }

    /// Append newly-arrived bytes from the connection.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pull the next fully-parsed record, driving the tokenizer as needed.
    /// Returns `None` when the buffer is exhausted or blocked on a partial
    /// tag; call again after the next `feed`.
    pub fn next_record(&mut self) -> Option<ParsedRecord> {
        if let Some(r) = self.pending.pop_front() {
            return Some(r);
        }
        loop {
            match next_step(&self.buf[self.pos..]) {
                Step::Incomplete => {
                    self.compact();
                    return None;
                }
                Step::Skip(n) => self.pos += n,
                Step::Emit(tok, n) => {
                    self.pos += n;
                    self.handle_token(tok);
                    if let Some(r) = self.pending.pop_front() {
                        self.compact();
                        return Some(r);
                    }
                }
            }
        }
    }

    fn compact(&mut self) {
        if self.pos > 0 {
            self.buf.drain(0..self.pos);
            self.pos = 0;
        }
    }

    fn handle_token(&mut self, tok: Token) {
        match tok {
            Token::Text(t) => self.current_text = t,
            Token::Open {
                name,
                attrs,
                self_closing,
            } => {
                let depth_before = self.stack.len();
                if depth_before == 0 {
                    self.open_top_level(&name, &attrs);
                } else {
                    self.open_nested(&name, &attrs);
                }
                if self_closing {
                    // A self-closing element never produces a matching Close
                    // token, so run its close-side logic immediately with no
                    // text content.
                    self.dispatch_close(&name, String::new());
                } else {
                    self.stack.push(name);
                }
            }
            Token::Close { name } => self.handle_close(name),
        }
    }

    fn open_top_level(&mut self, name: &str, attrs: &[(String, String)]) {
        match name {
            "traceentry" => match parse_entry_attrs(attrs) {
                Ok((pid, process_start_time, tid, timestamp)) => {
                    self.building = Some(Building::Entry(EntryBuilder {
                        pid,
                        process_start_time,
                        tid,
                        timestamp,
                        entry_type: None,
                        path: None,
                        line: None,
                        function: None,
                        process_name: None,
                        group: None,
                        message: None,
                        stack_position: 0,
                        variables: Vec::new(),
                        backtrace: Vec::new(),
                        trace_keys: Vec::new(),
                        in_frame: false,
                        current_frame: None,
                        current_variable: None,
                        current_key_enabled: false,
                        current_line_no: 0,
                    }));
                }
                Err(e) => {
                    warn!(error = %e, "malformed traceentry attributes, resynchronizing");
                    self.building = None;
                }
            },
            "shutdownevent" => match parse_shutdown_attrs(attrs) {
                Ok((pid, start_time, stop_time)) => {
                    self.building = Some(Building::Shutdown(ShutdownBuilder {
                        pid,
                        start_time,
                        stop_time,
                    }));
                }
                Err(e) => {
                    warn!(error = %e, "malformed shutdownevent attributes, resynchronizing");
                    self.building = None;
                }
            },
            "storageconfiguration" => match parse_config_attrs(attrs) {
                Ok((max_size, shrink_by)) => {
                    self.building = Some(Building::Config(ConfigBuilder {
                        max_size,
                        shrink_by,
                    }));
                }
                Err(e) => {
                    warn!(error = %e, "malformed storageconfiguration attributes, resynchronizing");
                    self.building = None;
                }
            },
            _ => {
                // Unknown top-level element: ignored silently for
                // forward compatibility, per spec.md §4.3.
                self.building = None;
            }
        }
    }

    fn open_nested(&mut self, name: &str, attrs: &[(String, String)]) {
        if let Some(Building::Entry(eb)) = &mut self.building {
            eb.open_child(name, attrs);
        }
    }

    fn handle_close(&mut self, name: String) {
        let pos = self.stack.iter().rposition(|n| *n == name);
        let Some(idx) = pos else {
            warn!(tag = %name, "unmatched closing tag, ignoring");
            return;
        };
        // Anything left open above `idx` was itself unclosed; drop it
        // silently and resynchronize at this tag.
        self.stack.truncate(idx);
        let text = std::mem::take(&mut self.current_text);
        self.dispatch_close(&name, text);
    }

    fn dispatch_close(&mut self, name: &str, text: String) {
        let depth_after = self.stack.len();
        if depth_after == 0 {
            self.finalize_top_level(name, text);
        } else if let Some(Building::Entry(eb)) = &mut self.building {
            eb.close_child(name, text.trim().to_string());
        }
    }

    fn finalize_top_level(&mut self, name: &str, text: String) {
        match (name, self.building.take()) {
            ("traceentry", Some(Building::Entry(eb))) => match eb.finish() {
                Some(entry) => self.pending.push_back(ParsedRecord::Entry(entry)),
                None => warn!("incomplete traceentry dropped, resynchronizing"),
            },
            ("shutdownevent", Some(Building::Shutdown(sb))) => {
                self.pending.push_back(ParsedRecord::Shutdown(ProcessShutdownEvent {
                    pid: sb.pid,
                    start_time: sb.start_time,
                    stop_time: sb.stop_time,
                    process_name: text.trim().to_string(),
                }));
            }
            ("storageconfiguration", Some(Building::Config(cb))) => {
                self.pending.push_back(ParsedRecord::StorageConfig(StorageConfiguration {
                    max_size: cb.max_size,
                    shrink_by: cb.shrink_by,
                    archive_dir: text.trim().to_string(),
                }));
            }
            _ => {}
        }
    }
}

fn parse_entry_attrs(attrs: &[(String, String)]) -> Result<(u32, i64, u32, i64), String> {
    let pid = attr(attrs, "pid")
        .ok_or("missing pid")?
        .parse()
        .map_err(|_| "invalid pid")?;
    let process_start_time = attr(attrs, "process_starttime")
        .ok_or("missing process_starttime")?
        .parse()
        .map_err(|_| "invalid process_starttime")?;
    let tid = attr(attrs, "tid")
        .ok_or("missing tid")?
        .parse()
        .map_err(|_| "invalid tid")?;
    let time = attr(attrs, "time")
        .ok_or("missing time")?
        .parse()
        .map_err(|_| "invalid time")?;
    Ok((pid, process_start_time, tid, time))
}

fn parse_shutdown_attrs(attrs: &[(String, String)]) -> Result<(u32, i64, i64), String> {
    let pid = attr(attrs, "pid")
        .ok_or("missing pid")?
        .parse()
        .map_err(|_| "invalid pid")?;
    let start_time = attr(attrs, "starttime")
        .ok_or("missing starttime")?
        .parse()
        .map_err(|_| "invalid starttime")?;
    let stop_time = attr(attrs, "endtime")
        .ok_or("missing endtime")?
        .parse()
        .map_err(|_| "invalid endtime")?;
    Ok((pid, start_time, stop_time))
}

fn parse_config_attrs(attrs: &[(String, String)]) -> Result<(MaxSize, u8), String> {
    let max_size_raw: u64 = attr(attrs, "maxSize")
        .ok_or("missing maxSize")?
        .parse()
        .map_err(|_| "invalid maxSize")?;
    let max_size = if max_size_raw == u64::MAX {
        MaxSize::Unlimited
    } else {
        MaxSize::Bytes(max_size_raw)
    };
    let shrink_by: u8 = attr(attrs, "shrinkBy")
        .ok_or("missing shrinkBy")?
        .parse()
        .map_err(|_| "invalid shrinkBy")?;
    Ok((max_size, shrink_by))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_entry_round_trips() {
        let mut p = StreamingParser::new();
        p.feed(br#"<traceentry pid="100" process_starttime="1000" tid="7" time="2000"><type>1</type><location lineno="42">/a/b.cpp</location><function>f</function><processname>p</processname><message>hi</message></traceentry>"#);
        let rec = p.next_record().expect("one record");
        match rec {
            ParsedRecord::Entry(e) => {
                assert_eq!(e.pid, 100);
                assert_eq!(e.process_start_time, 1000);
                assert_eq!(e.tid, 7);
                assert_eq!(e.timestamp, 2000);
                assert_eq!(e.entry_type, EntryType::Error);
                assert_eq!(e.path, "/a/b.cpp");
                assert_eq!(e.line, 42);
                assert_eq!(e.function, "f");
                assert_eq!(e.process_name, "p");
                assert_eq!(e.message, "hi");
            }
            _ => panic!("expected entry"),
        }
        assert!(p.next_record().is_none());
    }

    #[test]
    fn fragment_boundary_mid_tag_is_buffered() {
        let mut p = StreamingParser::new();
        p.feed(br#"<traceentry pid="1" process_starttime="0" tid="1" t"#);
        assert!(p.next_record().is_none());
        p.feed(br#"ime="5"><type>0</type><location lineno="1">a</location><function>f</function><processname>p</processname><message>m</message></traceentry>"#);
        let rec = p.next_record().expect("record after completion");
        assert!(matches!(rec, ParsedRecord::Entry(_)));
    }

    #[test]
    fn variables_and_frames_preserve_order() {
        let mut p = StreamingParser::new();
        p.feed(br#"<traceentry pid="1" process_starttime="0" tid="1" time="0">
            <type>0</type><location lineno="1">a</location><function>f</function>
            <processname>p</processname><message>m</message>
            <variable name="x" type="string">hello</variable>
            <variable name="y" type="number">42</variable>
            <frame><module>m0</module><function offset="16">fn0</function><location lineno="10">f0.cpp</location></frame>
            <frame><module>m1</module><function offset="32">fn1</function><location lineno="20">f1.cpp</location></frame>
            </traceentry>"#);
        let rec = p.next_record().unwrap();
        let e = match rec {
            ParsedRecord::Entry(e) => e,
            _ => panic!(),
        };
        assert_eq!(e.variables.len(), 2);
        assert_eq!(e.variables[0].name, "x");
        assert_eq!(e.variables[0].var_type, VariableType::String);
        assert_eq!(e.variables[1].name, "y");
        assert_eq!(e.variables[1].var_type, VariableType::Number);
        assert_eq!(e.backtrace.len(), 2);
        assert_eq!(e.backtrace[0].module, "m0");
        assert_eq!(e.backtrace[0].function_offset, 16);
        assert_eq!(e.backtrace[1].module, "m1");
        assert_eq!(e.backtrace[1].function_offset, 32);
    }

    #[test]
    fn malformed_entry_is_dropped_and_parser_resyncs() {
        let mut p = StreamingParser::new();
        p.feed(br#"<traceentry pid="notanumber" process_starttime="0" tid="1" time="0"><message>bad</message></traceentry>"#);
        p.feed(br#"<traceentry pid="1" process_starttime="0" tid="1" time="0"><type>0</type><location lineno="1">a</location><function>f</function><processname>p</processname><message>good</message></traceentry>"#);
        let rec = p.next_record().expect("second, well-formed entry");
        match rec {
            ParsedRecord::Entry(e) => assert_eq!(e.message, "good"),
            _ => panic!("expected entry"),
        }
        assert!(p.next_record().is_none());
    }

    #[test]
    fn unknown_top_level_element_is_ignored() {
        let mut p = StreamingParser::new();
        p.feed(br#"<futureextension foo="bar"><child>x</child></futureextension>"#);
        p.feed(br#"<shutdownevent pid="1" starttime="0" endtime="1">proc</shutdownevent>"#);
        let rec = p.next_record().expect("shutdown event");
        assert!(matches!(rec, ParsedRecord::Shutdown(_)));
    }

    #[test]
    fn storage_configuration_parses() {
        let mut p = StreamingParser::new();
        p.feed(br#"<storageconfiguration maxSize="1000" shrinkBy="50">/archives</storageconfiguration>"#);
        let rec = p.next_record().unwrap();
        match rec {
            ParsedRecord::StorageConfig(cfg) => {
                assert_eq!(cfg.max_size, MaxSize::Bytes(1000));
                assert_eq!(cfg.shrink_by, 50);
                assert_eq!(cfg.archive_dir, "/archives");
            }
            _ => panic!("expected storage config"),
        }
    }
}
