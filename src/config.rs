//! Boot configuration parsing (spec.md §6).
//!
//! The EFI partition carries a small `key=value` text file; the bootstrap
//! (out of scope for this crate) reads it and hands the raw bytes in here.
//! No `serde`/`toml` dependency is pulled in for three scalar fields --
//! grounded in the teacher's own hand-rolled line parsers (e.g.
//! `pkg/toml_parser.rs`, the shell's field-splitting in
//! `services/shell/expand.rs`) rather than reaching for a parsing crate
//! disproportionate to the job.

#[cfg(feature = "alloc")]
extern crate alloc;
#[cfg(feature = "alloc")]
use alloc::string::String;

/// Parsed boot configuration. Fields are owned `String`s (not borrowed
/// slices of the source buffer) because the source buffer lives in
/// bootloader-reclaimed memory that may not outlive early boot.
#[cfg(feature = "alloc")]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootConfig {
    pub ramdisk: Option<String>,
    pub kernel: Option<String>,
    pub cmdline: Option<String>,
}

#[cfg(feature = "alloc")]
impl BootConfig {
    /// Parse `key=value` lines, ignoring blank lines and anything with no
    /// `=`. Unrecognized keys are ignored rather than rejected: a newer
    /// bootstrap may pass keys this version of the core does not act on.
    pub fn parse(text: &str) -> Self {
        let mut config = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = String::from(value.trim());
            match key.trim() {
                "ramdisk" => config.ramdisk = Some(value),
                "kernel" => config.kernel = Some(value),
                "cmdline" => config.cmdline = Some(value),
                _ => {}
            }
        }
        config
    }

    /// Pull a `key=value` token out of `cmdline` (e.g. `loglevel=debug`).
    pub fn cmdline_value(&self, key: &str) -> Option<&str> {
        self.cmdline.as_deref()?.split_whitespace().find_map(|tok| {
            let (k, v) = tok.split_once('=')?;
            (k == key).then_some(v)
        })
    }
}

#[cfg(all(test, feature = "alloc"))]
mod tests {
    use super::*;

    #[test]
    fn parses_recognized_keys() {
        let cfg = BootConfig::parse("ramdisk=/efi/anillo/initrd\nkernel=/efi/anillo/kernel\ncmdline=loglevel=debug quiet\n");
        assert_eq!(cfg.ramdisk.as_deref(), Some("/efi/anillo/initrd"));
        assert_eq!(cfg.kernel.as_deref(), Some("/efi/anillo/kernel"));
        assert_eq!(cfg.cmdline_value("loglevel"), Some("debug"));
    }

    #[test]
    fn ignores_blank_lines_and_unknown_keys() {
        let cfg = BootConfig::parse("\n# not a real comment marker, just junk\nfuture_key=1\nkernel=/k\n");
        assert_eq!(cfg.kernel.as_deref(), Some("/k"));
        assert_eq!(cfg.ramdisk, None);
    }
}
