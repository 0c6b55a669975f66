//! Static pre-check for dangerous calls and imports in generated source.
//!
//! Parses each artifact into a syntax tree and walks it for calls to a denylist
//! of dynamic-execution and destructive symbols, and imports of low-level
//! network/mail modules. Findings block the artifact from being written.
//!
//! This is a structural gate, not a sandbox. Obfuscated or dynamically
//! constructed equivalents (`getattr(os, "sys" + "tem")`) are not detected.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tree_sitter::{Node, Parser};

/// Calls denied by default.
pub const DEFAULT_DENIED_CALLS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "__import__",
    "os.system",
    "os.popen",
    "os.remove",
    "os.rmdir",
    "os.unlink",
    "subprocess.run",
    "subprocess.call",
    "subprocess.Popen",
    "subprocess.check_output",
    "shutil.rmtree",
];

/// Module imports denied by default. Submodules are denied with their parent.
pub const DEFAULT_DENIED_IMPORTS: &[&str] = &[
    "socket",
    "http.client",
    "urllib.request",
    "ftplib",
    "smtplib",
    "telnetlib",
];

/// What a finding refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    DeniedCall,
    DeniedImport,
    ParseError,
}

impl std::fmt::Display for FindingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeniedCall => write!(f, "denied_call"),
            Self::DeniedImport => write!(f, "denied_import"),
            Self::ParseError => write!(f, "parse_error"),
        }
    }
}

/// A single pre-check finding. Positions are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyFinding {
    pub kind: FindingKind,
    pub symbol: String,
    pub line: usize,
    pub column: usize,
}

impl std::fmt::Display for SafetyFinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} at {}:{}",
            self.kind, self.symbol, self.line, self.column
        )
    }
}

/// Result of scanning one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub safe: bool,
    pub findings: Vec<SafetyFinding>,
}

impl ScanReport {
    fn from_findings(findings: Vec<SafetyFinding>) -> Self {
        Self {
            safe: findings.is_empty(),
            findings,
        }
    }

    /// One line per finding, for feedback prompts.
    pub fn summary(&self) -> String {
        self.findings
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Denylist policy shared by every scanner.
#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    denied_calls: HashSet<String>,
    denied_imports: Vec<String>,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_DENIED_CALLS.iter().map(|s| s.to_string()),
            DEFAULT_DENIED_IMPORTS.iter().map(|s| s.to_string()),
        )
    }
}

impl SafetyPolicy {
    pub fn new(
        denied_calls: impl IntoIterator<Item = String>,
        denied_imports: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            denied_calls: denied_calls.into_iter().collect(),
            denied_imports: denied_imports.into_iter().collect(),
        }
    }

    pub fn is_call_denied(&self, qualified: &str) -> bool {
        self.denied_calls.contains(qualified)
    }

    /// A module is denied when it equals a denied module or is nested in one.
    pub fn is_import_denied(&self, module: &str) -> bool {
        self.denied_imports.iter().any(|denied| {
            module == denied
                || module
                    .strip_prefix(denied.as_str())
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    }
}

/// A language-specific syntax-tree scanner.
pub trait SourceScanner {
    /// File extensions (without dot) this scanner handles.
    fn extensions(&self) -> &'static [&'static str];

    fn scan(&self, source: &str, policy: &SafetyPolicy) -> ScanReport;
}

/// Python scanner backed by tree-sitter-python.
#[derive(Debug, Default, Clone, Copy)]
pub struct PythonScanner;

impl SourceScanner for PythonScanner {
    fn extensions(&self) -> &'static [&'static str] {
        &["py", "pyi"]
    }

    fn scan(&self, source: &str, policy: &SafetyPolicy) -> ScanReport {
        let mut parser = Parser::new();
        if let Err(e) = parser.set_language(&tree_sitter_python::LANGUAGE.into()) {
            return ScanReport::from_findings(vec![SafetyFinding {
                kind: FindingKind::ParseError,
                symbol: format!("python grammar unavailable: {e}"),
                line: 0,
                column: 0,
            }]);
        }

        let Some(tree) = parser.parse(source, None) else {
            return ScanReport::from_findings(vec![SafetyFinding {
                kind: FindingKind::ParseError,
                symbol: "parser produced no tree".into(),
                line: 0,
                column: 0,
            }]);
        };

        let root = tree.root_node();
        if root.has_error() {
            let bad = first_error_node(root).unwrap_or(root);
            let pos = bad.start_position();
            let symbol = if bad.is_missing() {
                format!("syntax error: missing {}", bad.kind())
            } else {
                "syntax error".to_string()
            };
            return ScanReport::from_findings(vec![SafetyFinding {
                kind: FindingKind::ParseError,
                symbol,
                line: pos.row + 1,
                column: pos.column + 1,
            }]);
        }

        let mut walker = PythonWalker {
            source: source.as_bytes(),
            policy,
            aliases: HashMap::new(),
            findings: Vec::new(),
        };
        walker.walk(root);
        ScanReport::from_findings(walker.findings)
    }
}

/// Pre-order search for the first ERROR or MISSING node. Iterative, so nesting
/// depth of the source does not grow the call stack.
fn first_error_node(root: Node) -> Option<Node> {
    let mut cursor = root.walk();
    loop {
        let node = cursor.node();
        if node.is_error() || node.is_missing() {
            return Some(node);
        }
        if node.has_error() && cursor.goto_first_child() {
            continue;
        }
        loop {
            if cursor.goto_next_sibling() {
                break;
            }
            if !cursor.goto_parent() {
                return None;
            }
        }
    }
}

struct PythonWalker<'a> {
    source: &'a [u8],
    policy: &'a SafetyPolicy,
    /// Local name -> fully qualified name, from `import x as y` and
    /// `from x import y`.
    aliases: HashMap<String, String>,
    findings: Vec<SafetyFinding>,
}

impl PythonWalker<'_> {
    fn text(&self, node: Node) -> String {
        node.utf8_text(self.source).unwrap_or_default().to_string()
    }

    fn push(&mut self, kind: FindingKind, symbol: String, node: Node) {
        let pos = node.start_position();
        self.findings.push(SafetyFinding {
            kind,
            symbol,
            line: pos.row + 1,
            column: pos.column + 1,
        });
    }

    /// Pre-order walk with a tree cursor. Source order matters: aliases are
    /// recorded before later calls use them.
    fn walk(&mut self, root: Node) {
        let mut cursor = root.walk();
        loop {
            self.visit(cursor.node());
            if cursor.goto_first_child() {
                continue;
            }
            loop {
                if cursor.goto_next_sibling() {
                    break;
                }
                if !cursor.goto_parent() {
                    return;
                }
            }
        }
    }

    fn visit(&mut self, node: Node) {
        match node.kind() {
            "import_statement" => self.visit_import(node),
            "import_from_statement" => self.visit_import_from(node),
            "call" => self.visit_call(node),
            // The grammar keeps the Python 2 statement form.
            "exec_statement" if self.policy.is_call_denied("exec") => {
                self.push(FindingKind::DeniedCall, "exec".into(), node);
            }
            _ => {}
        }
    }

    fn visit_import(&mut self, node: Node) {
        let mut cursor = node.walk();
        for name in node.children_by_field_name("name", &mut cursor) {
            let (module, alias) = match name.kind() {
                "aliased_import" => (
                    name.child_by_field_name("name").map(|n| self.text(n)),
                    name.child_by_field_name("alias").map(|n| self.text(n)),
                ),
                _ => (Some(self.text(name)), None),
            };
            let Some(module) = module else { continue };

            if self.policy.is_import_denied(&module) {
                self.push(FindingKind::DeniedImport, module.clone(), name);
            }
            if let Some(alias) = alias {
                self.aliases.insert(alias, module);
            }
        }
    }

    fn visit_import_from(&mut self, node: Node) {
        let Some(module_node) = node.child_by_field_name("module_name") else {
            return;
        };
        let module = self.text(module_node);

        if self.policy.is_import_denied(&module) {
            self.push(FindingKind::DeniedImport, module.clone(), module_node);
        }

        let mut cursor = node.walk();
        for name in node.children_by_field_name("name", &mut cursor) {
            let (imported, local) = match name.kind() {
                "aliased_import" => (
                    name.child_by_field_name("name").map(|n| self.text(n)),
                    name.child_by_field_name("alias").map(|n| self.text(n)),
                ),
                _ => (Some(self.text(name)), None),
            };
            let Some(imported) = imported else { continue };
            let qualified = format!("{module}.{imported}");

            // `from http import client` pulls in a denied submodule.
            if !self.policy.is_import_denied(&module) && self.policy.is_import_denied(&qualified)
            {
                self.push(FindingKind::DeniedImport, qualified.clone(), name);
            }
            self.aliases
                .insert(local.unwrap_or_else(|| imported.clone()), qualified);
        }
    }

    fn visit_call(&mut self, node: Node) {
        let Some(function) = node.child_by_field_name("function") else {
            return;
        };
        let Some(dotted) = self.dotted_name(function) else {
            return;
        };
        let qualified = self.qualify(&dotted);

        if self.policy.is_call_denied(&qualified) {
            self.push(FindingKind::DeniedCall, qualified, function);
        } else if qualified != dotted && self.policy.is_call_denied(&dotted) {
            self.push(FindingKind::DeniedCall, dotted, function);
        }
    }

    /// `a.b.c` for identifier/attribute chains, `None` for anything dynamic.
    fn dotted_name(&self, node: Node) -> Option<String> {
        let mut parts = Vec::new();
        let mut current = node;
        loop {
            match current.kind() {
                "identifier" => {
                    parts.push(self.text(current));
                    break;
                }
                "attribute" => {
                    parts.push(self.text(current.child_by_field_name("attribute")?));
                    current = current.child_by_field_name("object")?;
                }
                _ => return None,
            }
        }
        parts.reverse();
        Some(parts.join("."))
    }

    /// Expand the head of a dotted name through recorded aliases.
    fn qualify(&self, dotted: &str) -> String {
        let (head, tail) = match dotted.split_once('.') {
            Some((head, tail)) => (head, Some(tail)),
            None => (dotted, None),
        };
        match (self.aliases.get(head), tail) {
            (Some(full), Some(tail)) => format!("{full}.{tail}"),
            (Some(full), None) => full.clone(),
            (None, _) => dotted.to_string(),
        }
    }
}

/// Routes artifacts to the scanner for their file type.
pub struct StaticPreCheck {
    policy: SafetyPolicy,
    scanners: Vec<Box<dyn SourceScanner + Send + Sync>>,
}

impl Default for StaticPreCheck {
    fn default() -> Self {
        Self::new(SafetyPolicy::default())
    }
}

impl StaticPreCheck {
    pub fn new(policy: SafetyPolicy) -> Self {
        Self {
            policy,
            scanners: vec![Box::new(PythonScanner)],
        }
    }

    /// Register an additional scanner.
    pub fn with_scanner(mut self, scanner: Box<dyn SourceScanner + Send + Sync>) -> Self {
        self.scanners.push(scanner);
        self
    }

    /// Scan `source` if a scanner handles `path`'s extension.
    /// Returns `None` for file types with no scanner.
    pub fn check(&self, path: &str, source: &str) -> Option<ScanReport> {
        let ext = Path::new(path).extension()?.to_str()?.to_lowercase();
        let scanner = self
            .scanners
            .iter()
            .find(|s| s.extensions().contains(&ext.as_str()))?;
        Some(scanner.scan(source, &self.policy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(source: &str) -> ScanReport {
        PythonScanner.scan(source, &SafetyPolicy::default())
    }

    #[test]
    fn test_clean_source_is_safe() {
        let report = scan("import math\n\ndef add(a, b):\n    return a + b\n\nprint(add(1, 2))\n");
        assert!(report.safe);
        assert!(report.findings.is_empty());
    }

    #[test]
    fn test_eval_on_input_flagged() {
        let report = scan("user = input()\nresult = eval(user)\n");
        assert!(!report.safe);
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].kind, FindingKind::DeniedCall);
        assert_eq!(report.findings[0].symbol, "eval");
        assert_eq!(report.findings[0].line, 2);
        assert_eq!(report.findings[0].column, 10);
    }

    #[test]
    fn test_dotted_calls_flagged() {
        let report = scan("import os, shutil\nos.system('ls')\nshutil.rmtree('/tmp/x')\n");
        let symbols: Vec<_> = report.findings.iter().map(|f| f.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["os.system", "shutil.rmtree"]);
    }

    #[test]
    fn test_aliases_resolved() {
        let report = scan("import subprocess as sp\nfrom os import remove as rm\nsp.run(['ls'])\nrm('f')\n");
        let symbols: Vec<_> = report.findings.iter().map(|f| f.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["subprocess.run", "os.remove"]);
    }

    #[test]
    fn test_denied_imports() {
        let report = scan("import socket\nimport http.client\nfrom urllib.request import urlopen\nfrom http import client\n");
        let symbols: Vec<_> = report
            .findings
            .iter()
            .filter(|f| f.kind == FindingKind::DeniedImport)
            .map(|f| f.symbol.as_str())
            .collect();
        assert_eq!(symbols, vec!["socket", "http.client", "urllib.request", "http.client"]);
    }

    #[test]
    fn test_similar_names_not_flagged() {
        let report = scan("import socketserver_helpers\nimport http\nmy.eval(1)\nevaluate(2)\n");
        assert!(report.safe, "unexpected findings: {:?}", report.findings);
    }

    #[test]
    fn test_parse_error_is_sole_finding() {
        let report = scan("def broken(:\n    eval('x')\n");
        assert!(!report.safe);
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].kind, FindingKind::ParseError);
    }

    #[test]
    fn test_nested_calls_found() {
        let report = scan("def f():\n    return [exec(c) for c in cmds]\n");
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].symbol, "exec");
    }

    #[test]
    fn test_custom_policy() {
        let policy = SafetyPolicy::new(vec!["pickle.loads".to_string()], Vec::new());
        let report = PythonScanner.scan("import pickle\npickle.loads(b'')\neval('1')\n", &policy);
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].symbol, "pickle.loads");
    }

    #[test]
    fn test_precheck_routes_by_extension() {
        let check = StaticPreCheck::default();
        assert!(check.check("notes.txt", "eval('x')").is_none());
        assert!(check.check("Makefile", "eval").is_none());
        let report = check.check("src/app.PY", "eval('x')\n").unwrap();
        assert!(!report.safe);
    }

    #[test]
    fn test_import_prefix_matching() {
        let policy = SafetyPolicy::default();
        assert!(policy.is_import_denied("socket"));
        assert!(policy.is_import_denied("http.client.foo"));
        assert!(!policy.is_import_denied("http"));
        assert!(!policy.is_import_denied("socketserver"));
    }

    fn nested(depth: usize, inner: &str) -> String {
        format!("x = {}{inner}{}\n", "(".repeat(depth), ")".repeat(depth))
    }

    #[test]
    fn test_deep_nesting_does_not_exhaust_stack() {
        let report = scan(&nested(20_000, "1"));
        assert!(report.safe, "unexpected findings: {:?}", report.findings);

        let report = scan(&nested(20_000, "eval(payload)"));
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].symbol, "eval");
        assert_eq!(report.findings[0].column, 20_005);
    }

    #[test]
    fn test_deep_nesting_with_syntax_error() {
        let source = format!("x = {}1\n", "(".repeat(2_000));
        let report = scan(&source);
        assert!(!report.safe);
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].kind, FindingKind::ParseError);
    }

    #[test]
    fn test_long_attribute_chain_resolved() {
        let chain = (0..5_000).map(|i| format!("a{i}")).collect::<Vec<_>>().join(".");
        let report = scan(&format!("{chain}()\nimport os as o\no.path.x.system()\no.system('ls')\n"));
        let symbols: Vec<_> = report.findings.iter().map(|f| f.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["os.system"]);
    }

    #[test]
    fn test_summary_lines() {
        let report = scan("eval('a')\nexec('b')\n");
        assert_eq!(
            report.summary(),
            "[denied_call] eval at 1:1\n[denied_call] exec at 2:1"
        );
    }
}
