use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

use crate::config::DEFAULT_TABLE;
use crate::error::{StoreError, StoreResult};

/// Message sent back for any line that is not a JSON request object.
pub const MALFORMED_JSON: &str = "Malformed JSON";

/// One decoded request line: `{"cmd": "<name>", "args": {...}}`.
///
/// Both fields are optional on the wire. A missing `cmd` decodes to an empty
/// name, which the command parser rejects as unknown; missing or `null` args
/// behave like an empty object.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub args: Option<Map<String, Value>>,
}

impl Request {
    /// Decodes one line (without its `\n` terminator).
    pub fn decode(line: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(line)
    }

    /// Lowercased command name as it is echoed back in responses.
    pub fn name(&self) -> String {
        self.cmd.as_deref().unwrap_or("").trim().to_ascii_lowercase()
    }

    pub fn command(&self) -> StoreResult<Command> {
        let empty = Map::new();
        Command::parse(&self.name(), self.args.as_ref().unwrap_or(&empty))
    }
}

/// Which column(s) a substring search matches against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchScope {
    KeyOrValue,
    Key,
    Value,
}

/// Where `init` reads its replacement mapping from.
#[derive(Clone, Debug, PartialEq)]
pub enum InitSource {
    File(PathBuf),
    Inline(Value),
}

/// Whether a command needs the scheduler's exclusive gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    Read,
    Write,
}

/// The fixed command vocabulary, with arguments already validated.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Use { table: String },
    Drop { table: String },
    Tables,
    Set { key: String, value: String },
    Get { key: String },
    Delete { key: String },
    Clear,
    Search { scope: SearchScope, pattern: String },
    List { page_size: Option<usize> },
    Next,
    Init { source: InitSource },
    Load { path: PathBuf },
    Dump,
    /// Raw statement passthrough. Executes verbatim against the whole working
    /// copy; any authenticated client holding it has full administrative access.
    Sql { statement: String },
}

impl Command {
    /// Builds a command from its (lowercased) name and its `args` object.
    ///
    /// ## Argument names
    /// - `k`: key for `set`/`get`/`delete`, table for `use`/`drop`
    /// - `v`: value for `set`
    /// - `q`: substring for the `search*` family
    /// - `n`: page size for `list`
    /// - `f`: file path for `init`/`load`
    /// - `data`: inline mapping for `init`
    /// - `sql`: statement for `sql`
    ///
    /// Unknown names are rejected, never ignored.
    pub fn parse(name: &str, args: &Map<String, Value>) -> StoreResult<Command> {
        let cmd = match name {
            "use" => Command::Use {
                table: string_arg(args, "k").unwrap_or_else(|| DEFAULT_TABLE.to_string()),
            },
            "drop" => Command::Drop { table: required(args, "k")? },
            "tables" => Command::Tables,
            "set" => Command::Set {
                key: required(args, "k")?,
                value: string_arg(args, "v").unwrap_or_default(),
            },
            "get" => Command::Get { key: required(args, "k")? },
            "delete" => Command::Delete { key: required(args, "k")? },
            "clear" => Command::Clear,
            "search" => Command::Search { scope: SearchScope::KeyOrValue, pattern: required(args, "q")? },
            "searchkey" => Command::Search { scope: SearchScope::Key, pattern: required(args, "q")? },
            "searchvalue" => Command::Search { scope: SearchScope::Value, pattern: required(args, "q")? },
            "list" => Command::List { page_size: page_size(args)? },
            "next" => Command::Next,
            "init" => {
                let source = match (string_arg(args, "f"), args.get("data")) {
                    (Some(f), _) => InitSource::File(PathBuf::from(f)),
                    (None, Some(data)) if !data.is_null() => InitSource::Inline(data.clone()),
                    _ => return Err(StoreError::invalid("init requires 'data' or 'f'")),
                };
                Command::Init { source }
            }
            "load" => Command::Load { path: PathBuf::from(required(args, "f")?) },
            "dump" => Command::Dump,
            "sql" => Command::Sql { statement: required(args, "sql")? },
            other => return Err(StoreError::UnknownCommand(other.to_string())),
        };
        Ok(cmd)
    }

    /// Mutating commands take the exclusive gate.
    ///
    /// `use` and `drop` count as writes: they change the schema and the
    /// process-wide active table pointer that every other command reads.
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Set { .. }
            | Command::Delete { .. }
            | Command::Clear
            | Command::Init { .. }
            | Command::Load { .. }
            | Command::Sql { .. }
            | Command::Use { .. }
            | Command::Drop { .. } => CommandKind::Write,
            _ => CommandKind::Read,
        }
    }
}

/// Reads an argument as a string. JSON strings are taken verbatim, any other
/// non-null value is serialized to its JSON text.
fn string_arg(args: &Map<String, Value>, name: &str) -> Option<String> {
    match args.get(name)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn required(args: &Map<String, Value>, name: &str) -> StoreResult<String> {
    string_arg(args, name).ok_or_else(|| StoreError::invalid(format!("Missing argument '{}'", name)))
}

fn page_size(args: &Map<String, Value>) -> StoreResult<Option<usize>> {
    let n = match args.get("n") {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_u64().and_then(|n| usize::try_from(n).ok()),
        Some(Value::String(s)) => s.trim().parse::<usize>().ok(),
        Some(_) => None,
    };
    match n {
        Some(n) if n > 0 => Ok(Some(n)),
        _ => Err(StoreError::invalid("Page size 'n' must be a positive integer")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// Paging metadata attached to `list n` and `next` responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// `"<delivered>/<total>"`
    pub progress: String,
    #[serde(rename = "hasMore")]
    pub has_more: bool,
}

/// One response line.
///
/// Success responses carry `data`; errors carry `message`. The follow-up
/// notice of an explicit `dump` is the one success response that carries a
/// `message` instead of `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
}

impl Response {
    pub fn success(command: &str, data: Value) -> Self {
        Self {
            status: Status::Success,
            command: Some(command.to_string()),
            data: Some(data),
            message: None,
            pagination: None,
        }
    }

    pub fn page(command: &str, data: Value, pagination: Pagination) -> Self {
        Self { pagination: Some(pagination), ..Self::success(command, data) }
    }

    pub fn error(command: &str, err: &StoreError) -> Self {
        Self {
            status: Status::Error,
            command: Some(command.to_string()),
            data: None,
            message: Some(err.to_string()),
            pagination: None,
        }
    }

    /// Status-only message, used for asynchronous completion notices.
    pub fn notice(command: &str, outcome: Result<String, String>) -> Self {
        let (status, message) = match outcome {
            Ok(m) => (Status::Success, m),
            Err(m) => (Status::Error, m),
        };
        Self { status, command: Some(command.to_string()), data: None, message: Some(message), pagination: None }
    }

    /// Protocol-level error for an undecodable line. Carries no `command`.
    pub fn malformed() -> Self {
        Self {
            status: Status::Error,
            command: None,
            data: None,
            message: Some(MALFORMED_JSON.to_string()),
            pagination: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// Serializes the response as a single `\n`-terminated line.
    pub fn encode(&self) -> Vec<u8> {
        // A Response only holds strings, bools and serde_json values, which
        // always serialize.
        let mut line = serde_json::to_vec(self).unwrap_or_else(|_| {
            br#"{"status":"error","message":"Internal error: response encoding"}"#.to_vec()
        });
        line.push(b'\n');
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(line: &str) -> StoreResult<Command> {
        Request::decode(line.as_bytes()).unwrap().command()
    }

    #[test]
    fn decodes_vocabulary() {
        assert_eq!(
            parse(r#"{"cmd":"SET","args":{"k":"a","v":"1"}}"#).unwrap(),
            Command::Set { key: "a".into(), value: "1".into() }
        );
        assert_eq!(parse(r#"{"cmd":"use"}"#).unwrap(), Command::Use { table: "store".into() });
        assert_eq!(
            parse(r#"{"cmd":"searchkey","args":{"q":"ab"}}"#).unwrap(),
            Command::Search { scope: SearchScope::Key, pattern: "ab".into() }
        );
        assert_eq!(parse(r#"{"cmd":"next","args":null}"#).unwrap(), Command::Next);
    }

    #[test]
    fn structured_values_are_serialized() {
        assert_eq!(
            parse(r#"{"cmd":"set","args":{"k":"a","v":{"x":1}}}"#).unwrap(),
            Command::Set { key: "a".into(), value: r#"{"x":1}"#.into() }
        );
        assert_eq!(
            parse(r#"{"cmd":"set","args":{"k":7,"v":true}}"#).unwrap(),
            Command::Set { key: "7".into(), value: "true".into() }
        );
    }

    #[test]
    fn page_size_accepts_numbers_and_numeric_strings() {
        assert_eq!(parse(r#"{"cmd":"list","args":{"n":3}}"#).unwrap(), Command::List { page_size: Some(3) });
        assert_eq!(parse(r#"{"cmd":"list","args":{"n":"4"}}"#).unwrap(), Command::List { page_size: Some(4) });
        assert_eq!(parse(r#"{"cmd":"list"}"#).unwrap(), Command::List { page_size: None });
        assert!(matches!(parse(r#"{"cmd":"list","args":{"n":0}}"#), Err(StoreError::InvalidArgument(_))));
        assert!(matches!(parse(r#"{"cmd":"list","args":{"n":"abc"}}"#), Err(StoreError::InvalidArgument(_))));
    }

    #[test]
    fn init_prefers_file_over_inline_data() {
        assert_eq!(
            parse(r#"{"cmd":"init","args":{"f":"seed.json","data":"{}"}}"#).unwrap(),
            Command::Init { source: InitSource::File("seed.json".into()) }
        );
        assert_eq!(
            parse(r#"{"cmd":"init","args":{"data":{"a":"1"}}}"#).unwrap(),
            Command::Init { source: InitSource::Inline(json!({"a": "1"})) }
        );
        assert!(parse(r#"{"cmd":"init","args":{}}"#).is_err());
    }

    #[test]
    fn rejects_unknown_and_missing_arguments() {
        assert!(matches!(parse(r#"{"cmd":"frobnicate"}"#), Err(StoreError::UnknownCommand(n)) if n == "frobnicate"));
        assert!(matches!(parse(r#"{"args":{}}"#), Err(StoreError::UnknownCommand(n)) if n.is_empty()));
        assert!(matches!(parse(r#"{"cmd":"get"}"#), Err(StoreError::InvalidArgument(_))));
    }

    #[test]
    fn rejects_non_object_lines() {
        assert!(Request::decode(b"not json").is_err());
        assert!(Request::decode(b"[1,2]").is_err());
        assert!(Request::decode(br#"{"cmd":"get""#).is_err());
    }

    #[test]
    fn classifies_writes() {
        assert_eq!(Command::Clear.kind(), CommandKind::Write);
        assert_eq!(Command::Sql { statement: "SELECT 1".into() }.kind(), CommandKind::Write);
        assert_eq!(Command::Next.kind(), CommandKind::Read);
        assert_eq!(Command::Dump.kind(), CommandKind::Read);
    }

    #[test]
    fn encodes_single_line_without_empty_fields() {
        let line = Response::success("get", json!("v")).encode();
        assert_eq!(line.last(), Some(&b'\n'));
        let text = String::from_utf8(line).unwrap();
        assert_eq!(text.trim_end(), r#"{"status":"success","command":"get","data":"v"}"#);

        let malformed = String::from_utf8(Response::malformed().encode()).unwrap();
        assert_eq!(malformed.trim_end(), r#"{"status":"error","message":"Malformed JSON"}"#);
    }
}
