//! Top-level symbol discovery in Python source.

use regex::Regex;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Class,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    /// 1-based line of the definition.
    pub line: usize,
}

#[allow(clippy::expect_used)]
static DEFINITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:async\s+)?def\s+(?P<func>\w+)\s*\(|^class\s+(?P<class>\w+)")
        .expect("constant regex pattern is valid")
});

/// Functions and classes defined at column zero, in source order.
pub fn discover(code: &str) -> Vec<Symbol> {
    code.lines()
        .enumerate()
        .filter_map(|(idx, line)| {
            let caps = DEFINITION.captures(line)?;
            let (name, kind) = match (caps.name("func"), caps.name("class")) {
                (Some(m), _) => (m.as_str(), SymbolKind::Function),
                (None, Some(m)) => (m.as_str(), SymbolKind::Class),
                (None, None) => return None,
            };
            Some(Symbol {
                name: name.to_string(),
                kind,
                line: idx + 1,
            })
        })
        .collect()
}
