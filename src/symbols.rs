//! Address to symbol resolution for diagnostics.
//!
//! There is no portable way to turn a code address into a name at runtime,
//! so at startup we ask `nm(1)` for the symbol table of our own binary and
//! keep the `(address, length, name)` triples around. Lookups pick the
//! tightest enclosing range, since debug tables commonly contain nested or
//! duplicated ranges.

use std::fmt;
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::{debug, warn};

/// One symbol from the binary's table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry {
    /// Start address.
    pub address: u64,
    /// Size in bytes.
    pub length: u64,
    /// Symbol name.
    pub name: String,
}

impl SymbolEntry {
    /// Address range check. The end address counts as inside.
    fn contains(&self, addr: u64) -> bool {
        addr >= self.address && addr - self.address <= self.length
    }
}

/// Result of a successful lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved<'a> {
    /// The address that was looked up.
    pub address: u64,
    /// Name of the enclosing symbol.
    pub name: &'a str,
    /// Distance from the symbol start.
    pub offset: u64,
}

impl fmt::Display for Resolved<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}: {}+{:#x}", self.address, self.name, self.offset)
    }
}

/// Immutable symbol table, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    entries: Vec<SymbolEntry>,
}

impl SymbolTable {
    /// Build a table from explicit entries.
    pub fn from_entries(entries: Vec<SymbolEntry>) -> Self {
        Self { entries }
    }

    /// Run `nm` on `binary` and parse its output.
    ///
    /// Any failure yields an empty table; lookups then report not-found.
    pub fn load(binary: &Path) -> Self {
        let output = Command::new("nm")
            .args(["-t", "x", "-n", "-P"])
            .arg(binary)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output();

        match output {
            Ok(out) => {
                let table = Self::parse(&String::from_utf8_lossy(&out.stdout));
                debug!("Loaded {} symbols from {:?}", table.len(), binary);
                table
            }
            Err(e) => {
                warn!("Cannot run nm on {:?}, symbol lookup disabled: {}", binary, e);
                Self::default()
            }
        }
    }

    /// Parse POSIX `nm -P -t x` output: `name type address length`.
    ///
    /// Lines without all four fields, or with non-hex numbers, are skipped.
    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let name = fields.next()?;
                let _kind = fields.next()?;
                let address = u64::from_str_radix(fields.next()?, 16).ok()?;
                let length = u64::from_str_radix(fields.next()?, 16).ok()?;
                Some(SymbolEntry {
                    address,
                    length,
                    name: name.to_string(),
                })
            })
            .collect();
        Self { entries }
    }

    /// Find the smallest symbol whose range covers `addr`.
    pub fn resolve(&self, addr: u64) -> Option<Resolved<'_>> {
        self.entries
            .iter()
            .filter(|e| e.contains(addr))
            .min_by_key(|e| e.length)
            .map(|e| Resolved {
                address: addr,
                name: &e.name,
                offset: addr - e.address,
            })
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no symbols were loaded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse an address as typed by an operator: `0x1f00` or bare hex.
pub fn parse_address(raw: &str) -> Option<u64> {
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    u64::from_str_radix(digits, 16).ok()
}
