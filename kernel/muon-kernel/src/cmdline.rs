//! Kernel command line parsing.
//!
//! The loader hands over a single space-separated string. Two token forms
//! are recognized: bare flags (`foo`) and key-value pairs (`key=value`).
//! Unknown tokens are ignored.

use alloc::string::String;
use alloc::vec::Vec;

use muon_core::sync::InitOnce;

/// Where kernel stderr output is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StderrRoute {
    /// Dropped.
    None,
    /// Folded into the regular kernel log.
    #[default]
    Log,
    /// Written directly to the serial port.
    Serial,
}

/// Parsed command line options.
#[derive(Debug, Default)]
pub struct CmdLine {
    tokens: Vec<String>,
}

impl CmdLine {
    /// Tokenizes a raw command line.
    pub fn parse(raw: &str) -> Self {
        Self {
            tokens: raw
                .split(' ')
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect(),
        }
    }

    /// Whether the bare flag `key` is present.
    pub fn flag(&self, key: &str) -> bool {
        self.tokens.iter().any(|t| t == key)
    }

    /// The value of the first `key=value` token, if any.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.tokens.iter().find_map(|t| {
            let rest = t.strip_prefix(key)?;
            rest.strip_prefix('=')
        })
    }

    /// Whether ACPI is enabled (`acpi={on,off}`, default on).
    pub fn acpi_enabled(&self) -> bool {
        self.value("acpi") != Some("off")
    }

    /// Selected stderr routing (`kstderr={none,log,serial}`).
    pub fn stderr_route(&self) -> StderrRoute {
        match self.value("kstderr") {
            Some("none") => StderrRoute::None,
            Some("serial") => StderrRoute::Serial,
            _ => StderrRoute::Log,
        }
    }
}

/// The boot command line, stored once during init.
pub static CMDLINE: InitOnce<CmdLine> = InitOnce::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_flags_and_pairs() {
        let cl = CmdLine::parse("quiet  acpi=off kstderr=serial");
        assert!(cl.flag("quiet"));
        assert!(!cl.flag("acpi"));
        assert_eq!(cl.value("acpi"), Some("off"));
        assert_eq!(cl.value("kstderr"), Some("serial"));
        assert_eq!(cl.value("missing"), None);
    }

    #[test]
    fn acpi_defaults_on() {
        assert!(CmdLine::parse("").acpi_enabled());
        assert!(CmdLine::parse("acpi=on").acpi_enabled());
        assert!(!CmdLine::parse("acpi=off").acpi_enabled());
    }

    #[test]
    fn stderr_routes() {
        assert_eq!(CmdLine::parse("").stderr_route(), StderrRoute::Log);
        assert_eq!(
            CmdLine::parse("kstderr=none").stderr_route(),
            StderrRoute::None
        );
        assert_eq!(
            CmdLine::parse("kstderr=serial").stderr_route(),
            StderrRoute::Serial
        );
        // Unknown values fall back to the log.
        assert_eq!(
            CmdLine::parse("kstderr=bogus").stderr_route(),
            StderrRoute::Log
        );
    }

    #[test]
    fn unknown_tokens_are_ignored() {
        let cl = CmdLine::parse("frobnicate=7 whatever");
        assert!(cl.acpi_enabled());
        assert_eq!(cl.stderr_route(), StderrRoute::Log);
    }

    #[test]
    fn value_requires_exact_key() {
        let cl = CmdLine::parse("acpixyz=off");
        assert_eq!(cl.value("acpi"), None);
    }
}
