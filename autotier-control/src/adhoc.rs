//! Newline-framed token-list protocol spoken over the two control FIFOs (§4.5).
//!
//! Each request line is a whitespace-separated token list; the first token is
//! the command name. Each response is a payload whose first token is `OK` or
//! `ERR`, followed by lines of output.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum StatusFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Oneshot,
    Pin { tier_id: String, paths: Vec<String> },
    Unpin { paths: Vec<String> },
    Status(StatusFormat),
    Config,
    ListPins,
    ListPopularity,
    WhichTier { paths: Vec<String> },
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("empty request")]
    Empty,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("{0} requires at least one argument")]
    MissingArgument(&'static str),
    #[error("oneshot and config take no arguments")]
    UnexpectedArgument,
}

impl Request {
    pub fn parse(line: &str) -> Result<Request, ParseError> {
        let mut tokens = line.split_whitespace();
        let command = tokens.next().ok_or(ParseError::Empty)?;
        let rest: Vec<String> = tokens.map(str::to_string).collect();

        match command {
            "oneshot" => {
                if !rest.is_empty() {
                    return Err(ParseError::UnexpectedArgument);
                }
                Ok(Request::Oneshot)
            }
            "pin" => {
                if rest.len() < 2 {
                    return Err(ParseError::MissingArgument("pin <tier_id> <path...>"));
                }
                Ok(Request::Pin {
                    tier_id: rest[0].clone(),
                    paths: rest[1..].to_vec(),
                })
            }
            "unpin" => {
                if rest.is_empty() {
                    return Err(ParseError::MissingArgument("unpin <path...>"));
                }
                Ok(Request::Unpin { paths: rest })
            }
            "status" => {
                let format = match rest.first().map(String::as_str) {
                    None | Some("table") => StatusFormat::Table,
                    Some("json") => StatusFormat::Json,
                    Some(_) => return Err(ParseError::UnexpectedArgument),
                };
                Ok(Request::Status(format))
            }
            "config" => {
                if !rest.is_empty() {
                    return Err(ParseError::UnexpectedArgument);
                }
                Ok(Request::Config)
            }
            "list-pins" => Ok(Request::ListPins),
            "list-popularity" => Ok(Request::ListPopularity),
            "which-tier" => {
                if rest.is_empty() {
                    return Err(ParseError::MissingArgument("which-tier <path...>"));
                }
                Ok(Request::WhichTier { paths: rest })
            }
            other => Err(ParseError::UnknownCommand(other.to_string())),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Request::Oneshot => "oneshot".to_string(),
            Request::Pin { tier_id, paths } => format!("pin {tier_id} {}", paths.join(" ")),
            Request::Unpin { paths } => format!("unpin {}", paths.join(" ")),
            Request::Status(StatusFormat::Table) => "status table".to_string(),
            Request::Status(StatusFormat::Json) => "status json".to_string(),
            Request::Config => "config".to_string(),
            Request::ListPins => "list-pins".to_string(),
            Request::ListPopularity => "list-popularity".to_string(),
            Request::WhichTier { paths } => format!("which-tier {}", paths.join(" ")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub ok: bool,
    pub lines: Vec<String>,
}

impl Response {
    pub fn ok(lines: Vec<String>) -> Self {
        Self { ok: true, lines }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            lines: vec![message.into()],
        }
    }

    pub fn encode(&self) -> String {
        let mut out = String::from(if self.ok { "OK" } else { "ERR" });
        for line in &self.lines {
            out.push('\n');
            out.push_str(line);
        }
        out
    }

    pub fn decode(payload: &str) -> Response {
        let mut lines = payload.split('\n');
        let ok = lines.next() == Some("OK");
        Response {
            ok,
            lines: lines.map(str::to_string).collect(),
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_oneshot() {
        assert_eq!(Request::parse("oneshot").unwrap(), Request::Oneshot);
    }

    #[test]
    fn oneshot_rejects_arguments() {
        assert!(matches!(
            Request::parse("oneshot extra"),
            Err(ParseError::UnexpectedArgument)
        ));
    }

    #[test]
    fn parses_pin_with_tier_and_paths() {
        let req = Request::parse("pin fast a.bin b.bin").unwrap();
        assert_eq!(
            req,
            Request::Pin {
                tier_id: "fast".to_string(),
                paths: vec!["a.bin".to_string(), "b.bin".to_string()],
            }
        );
    }

    #[test]
    fn pin_requires_tier_and_path() {
        assert!(matches!(
            Request::parse("pin fast"),
            Err(ParseError::MissingArgument(_))
        ));
    }

    #[test]
    fn status_defaults_to_table() {
        assert_eq!(Request::parse("status").unwrap(), Request::Status(StatusFormat::Table));
        assert_eq!(
            Request::parse("status json").unwrap(),
            Request::Status(StatusFormat::Json)
        );
    }

    #[test]
    fn unknown_command_errors() {
        assert!(matches!(
            Request::parse("frobnicate"),
            Err(ParseError::UnknownCommand(_))
        ));
    }

    #[test]
    fn response_round_trips_through_encode_decode() {
        let resp = Response::ok(vec!["line1".to_string(), "line2".to_string()]);
        let decoded = Response::decode(&resp.encode());
        assert!(decoded.ok);
        assert_eq!(decoded.lines, vec!["line1".to_string(), "line2".to_string()]);
    }

    #[test]
    fn err_response_round_trips() {
        let resp = Response::err("tier not found");
        let decoded = Response::decode(&resp.encode());
        assert!(!decoded.ok);
        assert_eq!(decoded.lines, vec!["tier not found".to_string()]);
    }
}
