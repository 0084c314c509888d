//! Static scan of module specifiers in task code.
//!
//! Finds the string literals passed to `require(...)`, dynamic `import(...)`
//! and static `import`/`export ... from` statements. Keywords inside string
//! literals and comments are ignored.
//!
//! A `require` with a computed argument is left to the sandbox's guarded
//! `require`. A dynamic `import()` with a computed argument cannot be hooked
//! at runtime, so it is reported separately and the caller decides.

use std::ops::Range;

use once_cell::sync::Lazy;
use regex::Regex;

/// A string literal without substitutions, in any of the three quote styles.
const LITERAL: &str = r#"(?:'(?P<single>[^'\n]*)'|"(?P<double>[^"\n]*)"|`(?P<template>[^`$]*)`)"#;

/// Strings and comments, leftmost first. Keywords found inside these spans
/// are not code.
static NON_CODE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"'(?:[^'\\\n]|\\.)*'|"(?:[^"\\\n]|\\.)*"|`(?:[^`\\]|\\.)*`|//[^\n]*|/\*(?s:.*?)\*/"#)
        .expect("static pattern")
});

static REQUIRE_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?:^|[^\w$.])(?P<kw>require)\s*\(\s*{LITERAL}\s*\)"))
        .expect("static pattern")
});

static IMPORT_CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^\w$.])(?P<kw>import)\s*\(").expect("static pattern"));

static LITERAL_ARGUMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"^\s*{LITERAL}\s*\)")).expect("static pattern"));

static IMPORT_STATEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?:^|[^\w$.])(?P<kw>import)\s*(?:[\w$*{{}},\s]+?\s*\bfrom\s*)?{LITERAL}"
    ))
    .expect("static pattern")
});

static EXPORT_FROM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?:^|[^\w$.])(?P<kw>export)\s*[\w$*{{}},\s]+?\s*\bfrom\s*{LITERAL}"
    ))
    .expect("static pattern")
});

/// What a scan of task code found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportScan {
    /// Literal module specifiers in source order, without duplicates.
    pub modules: Vec<String>,
    /// Argument text of `import(...)` calls whose specifier is computed.
    pub computed_imports: Vec<String>,
}

/// Scan `code` for module specifiers.
pub fn scan_imports(code: &str) -> ImportScan {
    let non_code: Vec<Range<usize>> = NON_CODE.find_iter(code).map(|m| m.range()).collect();
    let is_code = |pos: usize| !non_code.iter().any(|span| span.contains(&pos));

    let mut found: Vec<(usize, String)> = Vec::new();
    let mut computed_imports = Vec::new();

    for pattern in [&*REQUIRE_CALL, &*IMPORT_STATEMENT, &*EXPORT_FROM] {
        for caps in pattern.captures_iter(code) {
            let Some(keyword) = caps.name("kw") else {
                continue;
            };
            if !is_code(keyword.start()) {
                continue;
            }
            if let Some(module) = literal(&caps) {
                found.push((keyword.start(), module.to_string()));
            }
        }
    }

    for caps in IMPORT_CALL.captures_iter(code) {
        let (Some(keyword), Some(whole)) = (caps.name("kw"), caps.get(0)) else {
            continue;
        };
        if !is_code(keyword.start()) {
            continue;
        }
        let rest = &code[whole.end()..];
        match LITERAL_ARGUMENT.captures(rest) {
            Some(arg) => {
                if let Some(module) = literal(&arg) {
                    found.push((keyword.start(), module.to_string()));
                }
            }
            None => {
                let argument = rest.split(')').next().unwrap_or_default().trim();
                computed_imports.push(argument.to_string());
            }
        }
    }

    found.sort_by_key(|(pos, _)| *pos);
    let mut modules: Vec<String> = Vec::new();
    for (_, module) in found {
        if !module.is_empty() && !modules.contains(&module) {
            modules.push(module);
        }
    }

    ImportScan {
        modules,
        computed_imports,
    }
}

fn literal<'a>(caps: &regex::Captures<'a>) -> Option<&'a str> {
    caps.name("single")
        .or_else(|| caps.name("double"))
        .or_else(|| caps.name("template"))
        .map(|m| m.as_str())
}
