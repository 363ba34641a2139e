use anyhow::{Context, Result};
use log::warn;
use regex::Regex;
use std::fmt;

use crate::error::Error;

/// One exported symbol of the target DLL.
#[derive(Debug)]
pub struct Export {
    /// Export ordinal. Doubles as the 1-based slot number in the generated
    /// pointer table.
    pub ordinal: u32,
    /// Export hint as reported by dumpbin. Informational only.
    pub hint: String,
    /// RVA column as reported by dumpbin, kept verbatim.
    pub rva: String,
    /// The linker-visible symbol name, byte-for-byte as dumpbin printed it.
    pub mangled_name: String,
    /// Demangled name, once resolved. `None` until then.
    pub display_name: Option<String>,
}

impl Export {
    /// A symbol counts as C++-decorated when the demangler produced a name
    /// that differs from the raw one. Unresolved names stay plain.
    pub fn is_decorated(&self) -> bool {
        self.display_name
            .as_deref()
            .is_some_and(|name| name != self.mangled_name)
    }
}

impl fmt::Display for Export {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.display_name.as_deref().unwrap_or(&self.mangled_name);
        write!(f, "DLLExport: {} {} {}", self.ordinal, self.rva, name)
    }
}

/// The parsed export table, in dumpbin row order.
#[derive(Debug)]
pub struct ExportTable {
    pub exports: Vec<Export>,
    pub max_ordinal: u32,
}

impl ExportTable {
    /// Extracts the export table from raw `dumpbin /EXPORTS` output.
    ///
    /// The table is the block of fixed-column rows following the
    /// `ordinal  hint  RVA  name` header, terminated by a blank line. Rows
    /// whose name column is not a plain identifier (forwarders, unnamed
    /// data exports) are skipped with a warning rather than parsed wrong.
    pub fn parse(dump: &str) -> Result<Self> {
        let header_re = Regex::new(r"ordinal +hint +RVA +name")?;
        let row_re = Regex::new(r"^ +[0-9]+ +[0-9A-Za-z]+ +[0-9A-Za-z]+ +[A-Za-z0-9@$?_]+$")?;

        let header = header_re.find(dump).ok_or(Error::ExportTableNotFound)?;

        let mut exports: Vec<Export> = Vec::new();
        let mut max_ordinal = 0;
        let mut skipped = 0usize;

        for line in dump[header.end()..].lines() {
            if line.trim().is_empty() {
                // Blank lines before the first row belong to the header;
                // the first one after it ends the table.
                if exports.is_empty() && skipped == 0 {
                    continue;
                }
                break;
            }
            if !row_re.is_match(line) {
                skipped += 1;
                continue;
            }

            let mut columns = line.split_whitespace();
            let (Some(ordinal), Some(hint), Some(rva), Some(mangled_name)) =
                (columns.next(), columns.next(), columns.next(), columns.next())
            else {
                skipped += 1;
                continue;
            };
            let ordinal: u32 = ordinal
                .parse()
                .with_context(|| format!("bad ordinal in export row: {line:?}"))?;
            // Ordinals are 1-based; 0 would have no pointer-table slot.
            anyhow::ensure!(ordinal >= 1, "export ordinal 0 in row: {line:?}");

            max_ordinal = max_ordinal.max(ordinal);
            exports.push(Export {
                ordinal,
                hint: hint.into(),
                rva: rva.into(),
                mangled_name: mangled_name.into(),
                display_name: None,
            });
        }

        if exports.is_empty() {
            return Err(Error::ExportTableNotFound.into());
        }
        if skipped > 0 {
            warn!("skipped {skipped} export table row(s) without a plain identifier name");
        }

        Ok(Self {
            exports,
            max_ordinal,
        })
    }

    /// Batch request for the demangler: one `undname` line per export, in
    /// table order. Responses are matched back purely by position.
    pub fn demangle_request(&self) -> String {
        let mut request = String::new();
        for export in &self.exports {
            request.push_str("undname ");
            request.push_str(&export.mangled_name);
            request.push('\n');
        }
        request
    }

    /// Assigns demangled names from raw `undname` output.
    ///
    /// Every `is :- "<name>"` occurrence is taken in order of appearance and
    /// attached to the export at the same position. A short response leaves
    /// the tail unresolved, which classifies those exports as plain.
    pub fn resolve_names(&mut self, response: &str) -> Result<()> {
        let name_re = Regex::new(r#"is :- "(.+)""#)?;

        let mut resolved = 0usize;
        for (export, captures) in self.exports.iter_mut().zip(name_re.captures_iter(response)) {
            export.display_name = Some(captures[1].to_string());
            resolved += 1;
        }

        if resolved < self.exports.len() {
            warn!(
                "demangler returned {resolved} name(s) for {} request(s); \
                 the rest keep their raw names",
                self.exports.len()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dump() -> String {
        [
            "Microsoft (R) COFF/PE Dumper Version 14.29",
            "Copyright (C) Microsoft Corporation.  All rights reserved.",
            "",
            "Dump of file Foo.dll",
            "",
            "File Type: DLL",
            "",
            "  Section contains the following exports for Foo.dll",
            "",
            "    ordinal hint RVA      name",
            "",
            "          1    0 00001000 Add",
            "          2    1 00001020 ?Bar@@YAHXZ",
            "          5    2 00001040 _strip$me@4",
            "",
            "  Summary",
            "",
            "        1000 .data",
            "",
        ]
        .join("\r\n")
    }

    #[test]
    fn parses_every_row_in_order() {
        let table = ExportTable::parse(&dump()).unwrap();
        assert_eq!(table.exports.len(), 3);
        assert_eq!(table.max_ordinal, 5);

        let ordinals: Vec<u32> = table.exports.iter().map(|e| e.ordinal).collect();
        assert_eq!(ordinals, [1, 2, 5]);
        assert_eq!(table.exports[0].mangled_name, "Add");
        assert_eq!(table.exports[0].hint, "0");
        assert_eq!(table.exports[0].rva, "00001000");
        assert_eq!(table.exports[2].mangled_name, "_strip$me@4");
        assert!(table.exports.iter().all(|e| e.display_name.is_none()));
    }

    #[test]
    fn tolerates_unix_line_endings_and_extra_spaces() {
        let dump = "    ordinal  hint   RVA      name\n\n      1    0  00001000   Add\n\n";
        let table = ExportTable::parse(dump).unwrap();
        assert_eq!(table.exports.len(), 1);
        assert_eq!(table.exports[0].mangled_name, "Add");
    }

    #[test]
    fn missing_table_is_a_format_error() {
        let err = ExportTable::parse("LINK : fatal error LNK1181\r\n").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::ExportTableNotFound)
        ));
    }

    #[test]
    fn header_without_rows_is_a_format_error() {
        let dump = "    ordinal hint RVA      name\r\n\r\n\r\n  Summary\r\n";
        assert!(ExportTable::parse(dump).is_err());
    }

    #[test]
    fn forwarder_rows_are_skipped_not_parsed() {
        let dump = [
            "    ordinal hint RVA      name",
            "",
            "          1    0 00001000 Add",
            "          2    1          Fwd (forwarded to OTHER.Impl)",
            "          3    2 00001040 Sub",
            "",
        ]
        .join("\n");
        let table = ExportTable::parse(&dump).unwrap();
        let names: Vec<&str> = table
            .exports
            .iter()
            .map(|e| e.mangled_name.as_str())
            .collect();
        assert_eq!(names, ["Add", "Sub"]);
        assert_eq!(table.max_ordinal, 3);
    }

    #[test]
    fn demangle_request_preserves_order() {
        let table = ExportTable::parse(&dump()).unwrap();
        assert_eq!(
            table.demangle_request(),
            "undname Add\nundname ?Bar@@YAHXZ\nundname _strip$me@4\n"
        );
    }

    #[test]
    fn names_resolve_strictly_by_position() {
        let mut table = ExportTable::parse(&dump()).unwrap();
        let response = "Undecoration of :- \"Add\" is :- \"X\"\r\n\
                        Undecoration of :- \"?Bar@@YAHXZ\" is :- \"Y\"\r\n";
        table.resolve_names(response).unwrap();

        assert_eq!(table.exports[0].display_name.as_deref(), Some("X"));
        assert_eq!(table.exports[1].display_name.as_deref(), Some("Y"));
        assert_eq!(table.exports[2].display_name, None);
    }

    #[test]
    fn surplus_responses_are_ignored() {
        let mut table = ExportTable::parse(&dump()).unwrap();
        let response = [
            r#"is :- "a""#,
            r#"is :- "b""#,
            r#"is :- "c""#,
            r#"is :- "d""#,
        ]
        .join("\n");
        table.resolve_names(&response).unwrap();
        assert_eq!(table.exports.len(), 3);
        assert_eq!(table.exports[2].display_name.as_deref(), Some("c"));
    }

    #[test]
    fn classification_follows_display_name() {
        let plain = Export {
            ordinal: 1,
            hint: "0".into(),
            rva: "00001000".into(),
            mangled_name: "Add".into(),
            display_name: Some("Add".into()),
        };
        let decorated = Export {
            ordinal: 2,
            hint: "1".into(),
            rva: "00001020".into(),
            mangled_name: "?Bar@@YAHXZ".into(),
            display_name: Some("int Bar(void)".into()),
        };
        let unresolved = Export {
            ordinal: 3,
            hint: "2".into(),
            rva: "00001040".into(),
            mangled_name: "?Baz@@YAHXZ".into(),
            display_name: None,
        };
        assert!(!plain.is_decorated());
        assert!(decorated.is_decorated());
        assert!(!unresolved.is_decorated());
    }
}
