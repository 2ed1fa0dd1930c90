//! VRRP state notifications as emitted by Keepalived.

use common::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// VRRP state of one virtual router on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VrrpState {
    Master,
    Backup,
    Fault,
}

impl FromStr for VrrpState {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "master" => Ok(VrrpState::Master),
            "backup" => Ok(VrrpState::Backup),
            "fault" => Ok(VrrpState::Fault),
            _ => Err(Error::parse(format!("Unrecognized VRRP status {raw:?}"))),
        }
    }
}

impl fmt::Display for VrrpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            VrrpState::Master => "MASTER",
            VrrpState::Backup => "BACKUP",
            VrrpState::Fault => "FAULT",
        };
        f.write_str(text)
    }
}

/// A single `INSTANCE` notification.
///
/// `GROUP` notifications are not supported. The priority is carried along
/// but not interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub instance: String,
    pub state: VrrpState,
    pub priority: i32,
}

impl Notification {
    /// Parse the four notification tokens as passed on the command line.
    ///
    /// The kind token is matched case-insensitively; everything other than
    /// `instance` is rejected.
    pub fn from_args(kind: &str, instance: &str, state: &str, priority: &str) -> Result<Self> {
        if !kind.eq_ignore_ascii_case("instance") {
            return Err(Error::parse("Only instance notifications are supported"));
        }

        let state: VrrpState = state.parse()?;
        let priority = parse_priority(priority)?;

        Ok(Notification {
            instance: instance.to_string(),
            state,
            priority,
        })
    }

    /// Parse one newline-terminated FIFO record.
    ///
    /// Fields are space-separated with shell-style double quoting, so
    /// `INSTANCE "my app" MASTER 100` yields the instance name `my app`.
    pub fn parse_line(line: &str) -> Result<Self> {
        let fields = split_quoted(line)
            .ok_or_else(|| Error::parse(format!("Failed to parse notification: {line:?}")))?;
        Self::parse_fields(&fields)
    }

    fn parse_fields(fields: &[String]) -> Result<Self> {
        let line = fields.join(" ");

        if fields.len() != 4 {
            return Err(Error::parse(format!(
                "Notify message {line:?} has an unexpected format"
            )));
        }
        if fields[0] == "GROUP" {
            return Err(Error::parse("Only instance notifications are supported"));
        }
        if fields[0] != "INSTANCE" {
            return Err(Error::parse(format!(
                "Notify message {line:?} has an unexpected format"
            )));
        }

        let state: VrrpState = fields[2].parse().map_err(|_| {
            Error::parse(format!("Notify message {line:?} has an unexpected status"))
        })?;
        let priority = parse_priority(&fields[3])?;

        Ok(Notification {
            instance: fields[1].clone(),
            state,
            priority,
        })
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("INSTANCE ")?;

        if self.instance.contains(' ') || self.instance.contains('"') || self.instance.is_empty() {
            f.write_str("\"")?;
            f.write_str(&self.instance.replace('"', "\"\""))?;
            f.write_str("\"")?;
        } else {
            f.write_str(&self.instance)?;
        }

        write!(f, " {} {}", self.state, self.priority)
    }
}

fn parse_priority(raw: &str) -> Result<i32> {
    raw.parse()
        .map_err(|_| Error::parse(format!("Invalid notification priority {raw:?}")))
}

/// Split a line into space-separated fields with double-quote quoting.
///
/// A quote must wrap a whole field; a doubled quote inside a quoted field is
/// a literal quote. Returns `None` for malformed quoting or an empty line.
fn split_quoted(line: &str) -> Option<Vec<String>> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let mut fields = Vec::new();
    let mut chars = line.chars().peekable();

    while chars.peek().is_some() {
        let mut field = String::new();

        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next() {
                    // Doubled quote is an escaped literal quote
                    Some('"') if chars.peek() == Some(&'"') => {
                        chars.next();
                        field.push('"');
                    }
                    Some('"') => break,
                    Some(c) => field.push(c),
                    None => return None, // Unterminated quote
                }
            }
            match chars.next() {
                None | Some(' ') => {}
                Some(_) => return None, // Garbage after closing quote
            }
        } else {
            loop {
                match chars.next() {
                    None | Some(' ') => break,
                    Some('"') => return None, // Bare quote inside a field
                    Some(c) => field.push(c),
                }
            }
        }

        fields.push(field);
    }

    if fields.is_empty() {
        return None;
    }

    Some(fields)
}
