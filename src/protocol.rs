//! # Command Surface
//!
//! Commands travel as the payload of request frames using the MerkleKV text
//! protocol; replies come back as the payload of response frames.
//!
//! ## Request Format
//! - `GET <key>`, `SET <key> <value>`, `DEL <key>`
//! - `INC <key> [amount]`, `DEC <key> [amount]`
//! - `APPEND <key> <value>`, `PREPEND <key> <value>`
//! - `MGET <key1> ... <keyN>`, `MSET <key1> <value1> ...`, `TRUNCATE`
//! - `STATS`, `INFO`, `PING`
//!
//! ## Response Format
//! - `OK`, `PONG`, `NOT_FOUND`, `VALUE <data>`
//! - `VALUES <n>` followed by `<key> <value>` / `<key> NOT_FOUND` lines
//! - `ERROR <message>`
//! - anything else (STATS / INFO bodies) is returned as text

use crate::error::{Error, Result};

/// A request the client can send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get { key: String },
    Set { key: String, value: String },
    Delete { key: String },
    /// Increment a numeric value (server default amount: 1)
    Increment { key: String, amount: Option<i64> },
    /// Decrement a numeric value (server default amount: 1)
    Decrement { key: String, amount: Option<i64> },
    Append { key: String, value: String },
    Prepend { key: String, value: String },
    MultiGet { keys: Vec<String> },
    MultiSet { pairs: Vec<(String, String)> },
    Truncate,
    Stats,
    Info,
    Ping,
}

impl Command {
    /// Protocol keyword, used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "GET",
            Command::Set { .. } => "SET",
            Command::Delete { .. } => "DEL",
            Command::Increment { .. } => "INC",
            Command::Decrement { .. } => "DEC",
            Command::Append { .. } => "APPEND",
            Command::Prepend { .. } => "PREPEND",
            Command::MultiGet { .. } => "MGET",
            Command::MultiSet { .. } => "MSET",
            Command::Truncate => "TRUNCATE",
            Command::Stats => "STATS",
            Command::Info => "INFO",
            Command::Ping => "PING",
        }
    }

    /// Render the command as one protocol line (without terminator).
    pub fn encode(&self) -> String {
        let name = self.name();
        match self {
            Command::Get { key } | Command::Delete { key } => format!("{} {}", name, key),
            Command::Set { key, value }
            | Command::Append { key, value }
            | Command::Prepend { key, value } => format!("{} {} {}", name, key, value),
            Command::Increment { key, amount } | Command::Decrement { key, amount } => {
                match amount {
                    Some(amount) => format!("{} {} {}", name, key, amount),
                    None => format!("{} {}", name, key),
                }
            }
            Command::MultiGet { keys } => format!("{} {}", name, keys.join(" ")),
            Command::MultiSet { pairs } => {
                let args: Vec<String> = pairs.iter().map(|(k, v)| format!("{} {}", k, v)).collect();
                format!("{} {}", name, args.join(" "))
            }
            Command::Truncate | Command::Stats | Command::Info | Command::Ping => name.to_string(),
        }
    }
}

/// A decoded server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    Pong,
    NotFound,
    Value(String),
    /// MGET result in request order; `None` for missing keys
    Values(Vec<(String, Option<String>)>),
    Text(String),
}

impl Response {
    /// Parse a reply payload. `ERROR <message>` becomes `Error::Protocol`.
    pub fn parse(input: &str) -> Result<Response> {
        let mut lines = input.split("\r\n").filter(|l| !l.is_empty());
        let first = lines
            .next()
            .ok_or_else(|| Error::invalid_response("empty reply"))?;

        if let Some(message) = first.strip_prefix("ERROR ") {
            return Err(Error::protocol(message));
        }
        if let Some(value) = first.strip_prefix("VALUE ") {
            return Ok(Response::Value(value.to_string()));
        }
        if let Some(count) = first.strip_prefix("VALUES ") {
            let count: usize = count
                .trim()
                .parse()
                .map_err(|_| Error::invalid_response(format!("bad VALUES count: {}", count)))?;
            let values = lines
                .map(|line| match line.split_once(' ') {
                    Some((key, "NOT_FOUND")) => Ok((key.to_string(), None)),
                    Some((key, value)) => Ok((key.to_string(), Some(value.to_string()))),
                    None => Err(Error::invalid_response(format!("bad VALUES line: {}", line))),
                })
                .collect::<Result<Vec<_>>>()?;
            let found = values.iter().filter(|(_, v)| v.is_some()).count();
            if found != count {
                return Err(Error::invalid_response(format!(
                    "VALUES announced {} entries but carried {}",
                    count, found
                )));
            }
            return Ok(Response::Values(values));
        }
        match first {
            "OK" => Ok(Response::Ok),
            "PONG" => Ok(Response::Pong),
            "NOT_FOUND" => Ok(Response::NotFound),
            _ => Ok(Response::Text(input.trim_end().to_string())),
        }
    }
}

/// Parser for text commands typed by a user (CLI).
///
/// Command names are case-insensitive; `DEL` and `DELETE` are equivalent.
/// For `SET`, `APPEND` and `PREPEND` everything after the key is the value.
pub struct Protocol;

impl Protocol {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(&self, input: &str) -> Result<Command> {
        let input = input.trim();
        let parts: Vec<&str> = input.split_whitespace().collect();
        let Some(name) = parts.first() else {
            return Err(Error::invalid_command("Empty command"));
        };
        let name = name.to_uppercase();

        let key = || {
            parts
                .get(1)
                .map(|k| k.to_string())
                .ok_or_else(|| Error::invalid_command(format!("{} command requires a key", name)))
        };
        // Value may contain spaces: take the rest of the line after the key
        let value = || {
            let rest = input[parts[0].len()..].trim_start();
            let rest = rest[parts.get(1).map_or(0, |k| k.len())..].trim();
            if rest.is_empty() {
                Err(Error::invalid_command(format!("{} command requires a key and value", name)))
            } else {
                Ok(rest.to_string())
            }
        };
        let amount = || {
            parts
                .get(2)
                .map(|a| {
                    a.parse::<i64>().map_err(|_| {
                        Error::invalid_command(format!("{} command amount must be a valid number", name))
                    })
                })
                .transpose()
        };

        match name.as_str() {
            "GET" => Ok(Command::Get { key: key()? }),
            "SET" => Ok(Command::Set { key: key()?, value: value()? }),
            "DEL" | "DELETE" => Ok(Command::Delete { key: key()? }),
            "INC" => Ok(Command::Increment { key: key()?, amount: amount()? }),
            "DEC" => Ok(Command::Decrement { key: key()?, amount: amount()? }),
            "APPEND" => Ok(Command::Append { key: key()?, value: value()? }),
            "PREPEND" => Ok(Command::Prepend { key: key()?, value: value()? }),
            "MGET" => {
                if parts.len() < 2 {
                    return Err(Error::invalid_command("MGET command requires at least one key"));
                }
                Ok(Command::MultiGet {
                    keys: parts[1..].iter().map(|s| s.to_string()).collect(),
                })
            }
            "MSET" => {
                let args = &parts[1..];
                if args.is_empty() || args.len() % 2 != 0 {
                    return Err(Error::invalid_command(
                        "MSET command requires an even number of arguments (key-value pairs)",
                    ));
                }
                Ok(Command::MultiSet {
                    pairs: args
                        .chunks(2)
                        .map(|kv| (kv[0].to_string(), kv[1].to_string()))
                        .collect(),
                })
            }
            "TRUNCATE" => Ok(Command::Truncate),
            "STATS" => Ok(Command::Stats),
            "INFO" => Ok(Command::Info),
            "PING" => Ok(Command::Ping),
            _ => Err(Error::invalid_command(format!("Unknown command: {}", parts[0]))),
        }
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_set_keeps_spaces_in_value() {
        let protocol = Protocol::new();
        let result = protocol.parse("set greeting hello big world").unwrap();
        assert_eq!(
            result,
            Command::Set {
                key: "greeting".to_string(),
                value: "hello big world".to_string()
            }
        );
    }

    #[test]
    fn test_parse_increment_amount() {
        let protocol = Protocol::new();
        assert_eq!(
            protocol.parse("INC counter").unwrap(),
            Command::Increment { key: "counter".into(), amount: None }
        );
        assert_eq!(
            protocol.parse("DEC counter 5").unwrap(),
            Command::Decrement { key: "counter".into(), amount: Some(5) }
        );
        assert!(protocol.parse("INC counter five").is_err());
    }

    #[test]
    fn test_parse_errors() {
        let protocol = Protocol::new();
        assert!(matches!(protocol.parse(""), Err(Error::InvalidCommand { .. })));
        assert!(protocol.parse("GET").is_err());
        assert!(protocol.parse("SET key").is_err());
        assert!(protocol.parse("MSET a 1 b").is_err());
        assert!(protocol.parse("FLY away").is_err());
    }

    #[test]
    fn test_encode_matches_parse() {
        let protocol = Protocol::new();
        for line in ["GET k", "SET k some value", "DEL k", "INC n 3", "MGET a b c", "MSET a 1 b 2", "PING"] {
            let command = protocol.parse(line).unwrap();
            assert_eq!(command.encode(), line);
        }
    }

    #[test]
    fn test_response_parsing() {
        assert_eq!(Response::parse("OK\r\n").unwrap(), Response::Ok);
        assert_eq!(Response::parse("PONG").unwrap(), Response::Pong);
        assert_eq!(Response::parse("NOT_FOUND\r\n").unwrap(), Response::NotFound);
        assert_eq!(
            Response::parse("VALUE hello world\r\n").unwrap(),
            Response::Value("hello world".into())
        );
        assert!(matches!(
            Response::parse("ERROR Key not found"),
            Err(Error::Protocol { ref message }) if message == "Key not found"
        ));
        assert!(matches!(Response::parse(""), Err(Error::InvalidResponse { .. })));
    }

    #[test]
    fn test_values_response() {
        let reply = "VALUES 1\r\na 1\r\nb NOT_FOUND\r\n";
        assert_eq!(
            Response::parse(reply).unwrap(),
            Response::Values(vec![("a".into(), Some("1".into())), ("b".into(), None)])
        );
        assert!(Response::parse("VALUES 2\r\na 1\r\n").is_err());
    }
}
