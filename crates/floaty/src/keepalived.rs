//! Minimal parser for the VRRP instance blocks of a Keepalived
//! configuration.
//!
//! This is deliberately simplistic: it recognises `vrrp_instance NAME {`
//! blocks and their `virtual_ipaddress { ... }` sub-blocks, skips comments
//! and blank lines and ignores everything else.

use crate::address::NetAddress;
use common::{Error, Result};
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// One `vrrp_instance` block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VrrpInstance {
    pub name: String,
    pub addresses: Vec<NetAddress>,
}

/// Parsed Keepalived configuration.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct KeepalivedConfig {
    vrrp_instances: HashMap<String, VrrpInstance>,
}

impl KeepalivedConfig {
    /// The `vrrp_instance` block with the given name, if any.
    pub fn instance(&self, name: &str) -> Option<&VrrpInstance> {
        self.vrrp_instances.get(name)
    }

    pub fn instances(&self) -> impl Iterator<Item = &VrrpInstance> {
        self.vrrp_instances.values()
    }

    /// Parse a configuration from a reader.
    pub fn parse(reader: impl BufRead) -> Result<Self> {
        let mut parser = Parser::default();

        for (index, line) in reader.lines().enumerate() {
            let linenum = index + 1;
            let line = line.map_err(|err| {
                Error::parse(format!("Reading configuration failed: {err}"))
            })?;

            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!') {
                continue;
            }

            let fields: Vec<&str> = trimmed.split_ascii_whitespace().collect();
            parser
                .handle_line(&fields)
                .map_err(|err| Error::parse(format!("Line {linenum}: {err}")))?;
        }

        Ok(parser.cfg)
    }

    /// Parse the configuration file at `path`.
    pub fn parse_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::parse(BufReader::new(file))
    }
}

#[derive(Default)]
struct Parser {
    cfg: KeepalivedConfig,
    current_instance: Option<String>,
    parsing_addresses: bool,
}

impl Parser {
    fn handle_line(&mut self, fields: &[&str]) -> std::result::Result<(), String> {
        if fields.len() >= 2 && fields[0] == "vrrp_instance" {
            let name = fields[1];

            if self.cfg.vrrp_instances.contains_key(name) {
                return Err(format!("Duplicate VRRP instance name {name:?}"));
            }

            self.cfg.vrrp_instances.insert(
                name.to_string(),
                VrrpInstance {
                    name: name.to_string(),
                    addresses: Vec::new(),
                },
            );
            self.current_instance = Some(name.to_string());
            self.parsing_addresses = false;

            return Ok(());
        }

        let Some(current) = &self.current_instance else {
            return Ok(());
        };

        if self.parsing_addresses {
            if fields[0] == "}" {
                self.parsing_addresses = false;
                return Ok(());
            }

            // Optional suffixes like "dev eth1" are ignored
            let addr: NetAddress = fields[0].parse().map_err(|err| format!("{err}"))?;

            self.cfg
                .vrrp_instances
                .get_mut(current)
                .expect("current instance exists")
                .addresses
                .push(addr);

            return Ok(());
        }

        if fields.len() > 1 && fields[0] == "virtual_ipaddress" {
            self.parsing_addresses = true;
        }

        Ok(())
    }
}
