//! Occurrence sampling: find the Python sources under a root and the
//! identifier occurrences in them that are worth a definition request.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tree_sitter::{Language, Node, Parser};
use walkdir::{DirEntry, WalkDir};

use crate::error::BenchError;

/// Directory names never descended into (compared case-insensitively).
pub const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    ".venv",
    "venv",
    ".tox",
    "__pycache__",
    ".mypy_cache",
    ".pytest_cache",
    ".ruff_cache",
    "node_modules",
    "build",
    "dist",
    ".eggs",
    ".idea",
    ".vscode",
];

/// Identifiers whose definition lookup tells us nothing.
pub const EXCLUDED_NAMES: &[&str] = &[
    "True", "False", "None", "self", "cls", "int", "str", "float", "bool", "list", "dict", "set",
    "tuple", "object",
];

const SOURCE_EXTENSION: &str = "py";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OccurrenceKind {
    Name,
    Attr,
    Call,
    ImportedName,
    ImportedAttr,
    ImportedCall,
    AttrCall,
    ImportedAttrCall,
    Regex,
}

impl OccurrenceKind {
    pub fn is_imported(self) -> bool {
        matches!(
            self,
            OccurrenceKind::ImportedName
                | OccurrenceKind::ImportedAttr
                | OccurrenceKind::ImportedCall
                | OccurrenceKind::ImportedAttrCall
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OccurrenceKind::Name => "name",
            OccurrenceKind::Attr => "attr",
            OccurrenceKind::Call => "call",
            OccurrenceKind::ImportedName => "imported_name",
            OccurrenceKind::ImportedAttr => "imported_attr",
            OccurrenceKind::ImportedCall => "imported_call",
            OccurrenceKind::AttrCall => "attr_call",
            OccurrenceKind::ImportedAttrCall => "imported_attr_call",
            OccurrenceKind::Regex => "regex",
        }
    }
}

impl fmt::Display for OccurrenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An identifier occurrence. `line` is 1-based; `column` is 0-based and
/// counted in UTF-16 code units, which is what LSP positions use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occurrence {
    pub line: usize,
    pub column: usize,
    pub token: String,
    pub kind: OccurrenceKind,
}

/// All Python sources under `root`, in a stable (file-name sorted) order.
pub fn discover_source_files(root: &Path) -> Result<Vec<PathBuf>, BenchError> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_excluded_dir(e));
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!("skipping unreadable entry: {}", e);
                continue;
            }
        };
        if entry.file_type().is_file()
            && entry.path().extension().and_then(|e| e.to_str()) == Some(SOURCE_EXTENSION)
        {
            files.push(entry.into_path());
        }
    }
    if files.is_empty() {
        return Err(BenchError::NoSourceFiles(root.to_path_buf()));
    }
    Ok(files)
}

fn is_excluded_dir(entry: &DirEntry) -> bool {
    if entry.depth() == 0 || !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy().to_lowercase();
    EXCLUDED_DIRS.contains(&name.as_str())
}

/// Occurrences from the syntax tree, or from a plain identifier scan when the
/// source doesn't parse cleanly or the tree yields nothing.
pub fn collect_occurrences(source: &str) -> Vec<Occurrence> {
    match syntax_occurrences(source) {
        Some(occ) if !occ.is_empty() => occ,
        _ => regex_occurrences(source),
    }
}

/// `None` when the file has syntax errors.
pub fn syntax_occurrences(source: &str) -> Option<Vec<Occurrence>> {
    let language: Language = tree_sitter_python::LANGUAGE.into();
    let mut parser = Parser::new();
    parser.set_language(&language).ok()?;
    let tree = parser.parse(source, None)?;
    let root = tree.root_node();
    if root.has_error() {
        return None;
    }

    let src = source.as_bytes();
    let lines: Vec<&str> = source.lines().collect();
    let imports = Imports::collect(root, src);
    let mut out = Vec::new();

    let push = |out: &mut Vec<Occurrence>, node: Node, token: &str, kind: OccurrenceKind| {
        let at = node.start_position();
        out.push(Occurrence {
            line: at.row + 1,
            column: utf16_column(lines.get(at.row).copied().unwrap_or(""), at.column),
            token: token.to_string(),
            kind,
        });
    };

    preorder(root, |node| match node.kind() {
        "identifier" if is_name_reference(node) => {
            if let Some(name) = text(node, src).filter(|n| !is_excluded(n)) {
                let kind = if imports.names.contains(name) {
                    OccurrenceKind::ImportedName
                } else {
                    OccurrenceKind::Name
                };
                push(&mut out, node, name, kind);
            }
        }
        "attribute" => {
            if let Some((attr, name)) = attribute_target(node, src) {
                let kind = if imports.is_module_base(node, src) {
                    OccurrenceKind::ImportedAttr
                } else {
                    OccurrenceKind::Attr
                };
                push(&mut out, attr, name, kind);
            }
        }
        "call" => {
            let Some(callee) = node.child_by_field_name("function") else {
                return;
            };
            match callee.kind() {
                "identifier" => {
                    if let Some(name) = text(callee, src).filter(|n| !is_excluded(n)) {
                        let kind = if imports.names.contains(name) {
                            OccurrenceKind::ImportedCall
                        } else {
                            OccurrenceKind::Call
                        };
                        push(&mut out, callee, name, kind);
                    }
                }
                "attribute" => {
                    if let Some((attr, name)) = attribute_target(callee, src) {
                        let kind = if imports.is_module_base(callee, src) {
                            OccurrenceKind::ImportedAttrCall
                        } else {
                            OccurrenceKind::AttrCall
                        };
                        push(&mut out, attr, name, kind);
                    }
                }
                _ => {}
            }
        }
        _ => {}
    });

    Some(out)
}

/// Identifier-shaped tokens on every line, minus the exclusion list.
pub fn regex_occurrences(source: &str) -> Vec<Occurrence> {
    static IDENTIFIER: OnceLock<Regex> = OnceLock::new();
    let re = IDENTIFIER.get_or_init(|| {
        Regex::new(r"\b[A-Za-z_][A-Za-z0-9_]*\b").expect("identifier pattern is valid")
    });
    let mut out = Vec::new();
    for (i, line) in source.lines().enumerate() {
        for m in re.find_iter(line) {
            if is_excluded(m.as_str()) {
                continue;
            }
            out.push(Occurrence {
                line: i + 1,
                column: utf16_column(line, m.start()),
                token: m.as_str().to_string(),
                kind: OccurrenceKind::Regex,
            });
        }
    }
    out
}

fn is_excluded(name: &str) -> bool {
    EXCLUDED_NAMES.contains(&name)
}

fn text<'a>(node: Node, src: &'a [u8]) -> Option<&'a str> {
    node.utf8_text(src).ok()
}

fn utf16_column(line: &str, byte_col: usize) -> usize {
    line.get(..byte_col)
        .map(|prefix| prefix.encode_utf16().count())
        .unwrap_or(byte_col)
}

/// Visit every node, parents before children.
fn preorder<'t>(root: Node<'t>, mut f: impl FnMut(Node<'t>)) {
    let mut cursor = root.walk();
    loop {
        f(cursor.node());
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

/// The `y` of `x.y`, unless `y` is on the exclusion list.
fn attribute_target<'t, 's>(node: Node<'t>, src: &'s [u8]) -> Option<(Node<'t>, &'s str)> {
    let attr = node.child_by_field_name("attribute")?;
    let name = text(attr, src)?;
    (!is_excluded(name)).then_some((attr, name))
}

/// True for identifiers used as a value (a load or store of a variable), and
/// false for binding sites such as def/class names, parameters, keyword
/// argument names and import clauses.
fn is_name_reference(node: Node) -> bool {
    let Some(parent) = node.parent() else {
        return false;
    };
    let is_field = |field: &str| parent.child_by_field_name(field) == Some(node);
    match parent.kind() {
        "attribute" => !is_field("attribute"),
        "function_definition" | "class_definition" | "keyword_argument" | "default_parameter"
        | "typed_default_parameter" => !is_field("name"),
        "list_splat_pattern" | "dictionary_splat_pattern" => !parent.parent().is_some_and(|g| {
            matches!(g.kind(), "parameters" | "lambda_parameters" | "typed_parameter")
        }),
        "parameters" | "lambda_parameters" | "typed_parameter" | "dotted_name" | "aliased_import"
        | "import_statement" | "import_from_statement" | "relative_import"
        | "global_statement" | "nonlocal_statement" => false,
        _ => true,
    }
}

/// Names bound by import statements anywhere in the file.
#[derive(Debug, Default)]
struct Imports {
    /// Every imported binding.
    names: HashSet<String>,
    /// Bindings from `import a.b` / `import a as b` (modules only).
    modules: HashSet<String>,
}

impl Imports {
    fn collect(root: Node, src: &[u8]) -> Self {
        let mut imports = Imports::default();
        preorder(root, |node| {
            let from_import = match node.kind() {
                "import_statement" => false,
                "import_from_statement" => true,
                _ => return,
            };
            let mut cursor = node.walk();
            for clause in node.children_by_field_name("name", &mut cursor) {
                let Some(bound) = bound_name(clause, src, from_import) else {
                    continue;
                };
                if !from_import {
                    imports.modules.insert(bound.clone());
                }
                imports.names.insert(bound);
            }
        });
        imports
    }

    /// Is the object of this attribute node a bare imported module name?
    fn is_module_base(&self, attribute: Node, src: &[u8]) -> bool {
        attribute
            .child_by_field_name("object")
            .filter(|obj| obj.kind() == "identifier")
            .and_then(|obj| text(obj, src))
            .is_some_and(|name| self.modules.contains(name))
    }
}

/// The local name an import clause binds: the alias if there is one, else the
/// first dotted component (`import a.b` binds `a`).
fn bound_name(clause: Node, src: &[u8], from_import: bool) -> Option<String> {
    let dotted = match clause.kind() {
        "aliased_import" => {
            if let Some(alias) = clause.child_by_field_name("alias") {
                return text(alias, src).map(str::to_string);
            }
            clause.child_by_field_name("name")?
        }
        "dotted_name" => clause,
        _ => return None,
    };
    let full = text(dotted, src)?;
    let bound = if from_import {
        full
    } else {
        full.split('.').next().unwrap_or(full)
    };
    Some(bound.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn kinds_of(occ: &[Occurrence], token: &str) -> Vec<OccurrenceKind> {
        occ.iter().filter(|o| o.token == token).map(|o| o.kind).collect()
    }

    #[test]
    fn imported_module_attribute_call() {
        let src = "import os\ndef f(): return os.getcwd()\n";
        let occ = syntax_occurrences(src).unwrap();

        assert_eq!(kinds_of(&occ, "os"), vec![OccurrenceKind::ImportedName]);
        let getcwd = kinds_of(&occ, "getcwd");
        assert!(getcwd.contains(&OccurrenceKind::ImportedAttr));
        assert!(getcwd.contains(&OccurrenceKind::ImportedAttrCall));
        assert!(kinds_of(&occ, "f").is_empty(), "def names are not references");

        let attr = occ.iter().find(|o| o.token == "getcwd").unwrap();
        assert_eq!((attr.line, attr.column), (2, 19));
        let base = occ.iter().find(|o| o.token == "os").unwrap();
        assert_eq!((base.line, base.column), (2, 16));
    }

    #[test]
    fn plain_names_calls_and_attributes() {
        let src = "def helper(x):\n    return x\n\nclass A:\n    pass\n\nobj = A()\nobj.value = helper(obj.size)\n";
        let occ = syntax_occurrences(src).unwrap();

        assert!(kinds_of(&occ, "helper").contains(&OccurrenceKind::Call));
        assert!(kinds_of(&occ, "A").contains(&OccurrenceKind::Call));
        assert_eq!(kinds_of(&occ, "value"), vec![OccurrenceKind::Attr]);
        assert_eq!(kinds_of(&occ, "size"), vec![OccurrenceKind::Attr]);
        // `x` as a parameter is a binding; only the use in `return x` counts
        assert_eq!(kinds_of(&occ, "x"), vec![OccurrenceKind::Name]);
        assert!(occ.iter().all(|o| !o.kind.is_imported()));
    }

    #[test]
    fn from_imports_mark_names_not_modules() {
        let src = "from pathlib import Path\nfrom json import loads as parse\np = Path('.')\nparse(p.name)\nPath.cwd()\n";
        let occ = syntax_occurrences(src).unwrap();

        assert!(kinds_of(&occ, "Path").contains(&OccurrenceKind::ImportedCall));
        assert!(kinds_of(&occ, "Path").contains(&OccurrenceKind::ImportedName));
        assert!(kinds_of(&occ, "parse").contains(&OccurrenceKind::ImportedCall));
        // only `import x` bindings count as module bases for attributes
        assert_eq!(kinds_of(&occ, "cwd"), vec![OccurrenceKind::AttrCall, OccurrenceKind::Attr]);
        assert!(kinds_of(&occ, "loads").is_empty());
    }

    #[test]
    fn aliased_and_dotted_module_imports() {
        let src = "import numpy as np\nimport os.path\nnp.array([])\nos.path.join('a')\n";
        let occ = syntax_occurrences(src).unwrap();

        assert!(kinds_of(&occ, "array").contains(&OccurrenceKind::ImportedAttrCall));
        // `os.path` has an imported module base; `.join` hangs off an attribute
        assert_eq!(kinds_of(&occ, "path"), vec![OccurrenceKind::ImportedAttr]);
        assert!(kinds_of(&occ, "join").contains(&OccurrenceKind::AttrCall));
        assert!(kinds_of(&occ, "numpy").is_empty());
    }

    #[test]
    fn excluded_names_never_appear() {
        let src = "class A:\n    def m(self):\n        return self.x or None or int(True)\n";
        let occ = syntax_occurrences(src).unwrap();
        for o in &occ {
            assert!(!EXCLUDED_NAMES.contains(&o.token.as_str()), "{:?}", o);
        }
        assert!(kinds_of(&occ, "x").contains(&OccurrenceKind::Attr));
    }

    #[test]
    fn malformed_source_falls_back_to_regex() {
        let src = "def broken(:\n    value = self.thing\n";
        assert!(syntax_occurrences(src).is_none());
        let occ = collect_occurrences(src);
        assert!(!occ.is_empty());
        assert!(occ.iter().all(|o| o.kind == OccurrenceKind::Regex));
        assert!(occ.iter().all(|o| o.token != "self"));
        let thing = occ.iter().find(|o| o.token == "thing").unwrap();
        assert_eq!((thing.line, thing.column), (2, 17));
    }

    #[test]
    fn comment_only_source_falls_back_and_may_be_empty() {
        assert!(collect_occurrences("").is_empty());
        let occ = collect_occurrences("# just a note\n");
        assert_eq!(
            occ.iter().map(|o| o.token.as_str()).collect::<Vec<_>>(),
            vec!["just", "a", "note"]
        );
    }

    #[test]
    fn columns_are_utf16() {
        let src = "s = 'é😀'; t = s\n";
        let occ = syntax_occurrences(src).unwrap();
        let t = occ.iter().find(|o| o.token == "s" && o.column > 0).unwrap();
        // 'é' is one UTF-16 unit, the emoji two
        assert_eq!(t.column, 15);
    }

    #[test]
    fn discovery_skips_excluded_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for rel in [
            "pkg/mod.py",
            "pkg/sub/deep.py",
            "top.py",
            "notes.txt",
            ".venv/lib/site.py",
            "pkg/__pycache__/mod.py",
            "Build/gen.py",
            "node_modules/x/y.py",
        ] {
            let p = root.join(rel);
            fs::create_dir_all(p.parent().unwrap()).unwrap();
            fs::write(&p, "x = 1\n").unwrap();
        }
        let files = discover_source_files(root).unwrap();
        let rel: Vec<String> = files
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(rel, vec!["pkg/mod.py", "pkg/sub/deep.py", "top.py"]);
    }

    #[test]
    fn discovery_fails_on_empty_tree() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("README.md"), "hi").unwrap();
        assert!(matches!(
            discover_source_files(dir.path()),
            Err(BenchError::NoSourceFiles(_))
        ));
    }
}
